//! 传输无关的请求/响应契约。
//!
//! 路由核心只通过这里的两个 trait 触达请求与响应，HTTP 套接字与 Worker 回调各自实现一份，
//! 从而共享同一套分发机制。

use std::collections::BTreeSet;

use crate::{error::HandlerError, method, path::Params};

/// 路由核心读取请求所需的最小视图。
///
/// # 契约 (What)
/// - `method`：原始方法名，大小写不做要求；升级请求为伪方法 `upgrade`；
/// - `path`：当前可见路径，进入 `use` 挂载点后被改写为挂载点之后的剩余部分；
/// - `header`：大小写不敏感的头部读取；
/// - `params_mut`：命中路由后写入路径参数。
pub trait RoutedRequest: Send + 'static {
    fn method(&self) -> &str;

    fn path(&self) -> &str;

    fn set_path(&mut self, path: String);

    fn header(&self, name: &str) -> Option<&str>;

    fn params(&self) -> &Params;

    fn params_mut(&mut self) -> &mut Params;
}

/// 路由核心写响应所需的最小能力：自动 OPTIONS 应答。
pub trait RoutedResponse: Send + 'static {
    /// 以 `allow` 写出完整的 OPTIONS 响应。
    fn send_allow(&mut self, allow: &AllowList) -> Result<(), HandlerError>;
}

/// OPTIONS 自动应答期间累积的方法集合。
///
/// 集合有序且去重，[`header_value`](Self::header_value) 产出排序后以 `", "` 连接的字符串；
/// 名称保持注册时的大小写。
///
/// 伪方法 `UPGRADE` 刻意不计入：它只是协议升级层的匹配条件，不是客户端可以直接发出的
/// HTTP 方法，写进 `Allow` 会误导客户端。升级层仍参与分发，只是不被 OPTIONS 公布。
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AllowList {
    methods: BTreeSet<String>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<'a>(&mut self, methods: impl IntoIterator<Item = &'a String>) {
        for name in methods {
            if !method::is(name, method::UPGRADE) {
                self.methods.insert(name.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    pub fn header_value(&self) -> String {
        self.methods
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
