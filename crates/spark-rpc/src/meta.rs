//! # meta 模块说明
//!
//! ## 角色定位（Why）
//! - 用一份声明描述“谁可以调用什么、是否期待回复”，服务端绑定与客户端绑定都从它派生；
//! - 描述符同时携带两种远程代理类型：客户端调用服务端用的 `SP`，服务端回调客户端用的 `CP`。
//!
//! ## 设计要求（What）
//! - 四个能力集合互不相交且保持声明顺序；
//! - 远程代理只放行描述符中对应一侧的能力名称。

use std::{collections::BTreeSet, fmt, marker::PhantomData, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    connection::Connection,
    error::{MetaError, RpcError},
};

/// 能力所属的集合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// 客户端发起、服务端执行、无回复。
    ServerOneWay,
    /// 客户端发起、服务端执行、有回复。
    ServerTwoWay,
    /// 服务端发起、客户端执行、无回复。
    ClientOneWay,
    /// 服务端发起、客户端执行、有回复。
    ClientTwoWay,
}

/// 由远程句柄构造的类型化代理。
pub trait FromRemote: Send + Sync + Sized + 'static {
    fn from_remote(remote: RemoteProxy) -> Self;
}

/// 能力描述符。
///
/// # 教案式说明
/// - **意图 (Why)**：把一组能力名称分成四个不相交集合，绑定器据此决定暴露哪些本地实现、
///   为哪些名称合成出站存根；
/// - **逻辑 (How)**：通过 [`MetaBuilder`] 声明，`build` 时检查重名；
///   [`with_proxies`](Self::with_proxies) 只替换代理类型参数，不改变集合；
/// - **契约 (What)**：同一名称只会出现在一个集合中。
pub struct Meta<SP = RemoteProxy, CP = RemoteProxy> {
    server_one_way: Vec<String>,
    server_two_way: Vec<String>,
    client_one_way: Vec<String>,
    client_two_way: Vec<String>,
    _proxies: PhantomData<fn() -> (SP, CP)>,
}

impl<SP, CP> Clone for Meta<SP, CP> {
    fn clone(&self) -> Self {
        Self {
            server_one_way: self.server_one_way.clone(),
            server_two_way: self.server_two_way.clone(),
            client_one_way: self.client_one_way.clone(),
            client_two_way: self.client_two_way.clone(),
            _proxies: PhantomData,
        }
    }
}

impl<SP, CP> fmt::Debug for Meta<SP, CP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meta")
            .field("server_one_way", &self.server_one_way)
            .field("server_two_way", &self.server_two_way)
            .field("client_one_way", &self.client_one_way)
            .field("client_two_way", &self.client_two_way)
            .finish()
    }
}

impl Meta {
    pub fn builder() -> MetaBuilder {
        MetaBuilder::default()
    }
}

impl<SP, CP> Meta<SP, CP> {
    /// 以新的代理类型重新标注描述符。
    pub fn with_proxies<SP2, CP2>(self) -> Meta<SP2, CP2> {
        Meta {
            server_one_way: self.server_one_way,
            server_two_way: self.server_two_way,
            client_one_way: self.client_one_way,
            client_two_way: self.client_two_way,
            _proxies: PhantomData,
        }
    }

    pub fn server_one_way(&self) -> &[String] {
        &self.server_one_way
    }

    pub fn server_two_way(&self) -> &[String] {
        &self.server_two_way
    }

    pub fn client_one_way(&self) -> &[String] {
        &self.client_one_way
    }

    pub fn client_two_way(&self) -> &[String] {
        &self.client_two_way
    }

    pub fn capability_kind(&self, name: &str) -> Option<CapabilityKind> {
        [
            (&self.server_one_way, CapabilityKind::ServerOneWay),
            (&self.server_two_way, CapabilityKind::ServerTwoWay),
            (&self.client_one_way, CapabilityKind::ClientOneWay),
            (&self.client_two_way, CapabilityKind::ClientTwoWay),
        ]
        .into_iter()
        .find_map(|(names, kind)| names.iter().any(|n| n == name).then_some(kind))
    }

    /// 全部名称，按集合顺序。
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.server_one_way
            .iter()
            .chain(&self.server_two_way)
            .chain(&self.client_one_way)
            .chain(&self.client_two_way)
            .map(String::as_str)
    }

    pub(crate) fn from_sets(
        server_one_way: Vec<String>,
        server_two_way: Vec<String>,
        client_one_way: Vec<String>,
        client_two_way: Vec<String>,
    ) -> Self {
        Self {
            server_one_way,
            server_two_way,
            client_one_way,
            client_two_way,
            _proxies: PhantomData,
        }
    }

    /// 客户端侧远程句柄：只放行服务端能力。
    pub fn server_remote(&self, connection: Connection) -> RemoteProxy {
        RemoteProxy::new(connection, &self.server_one_way, &self.server_two_way)
    }

    /// 服务端侧远程句柄：只放行客户端能力。
    pub fn client_remote(&self, connection: Connection) -> RemoteProxy {
        RemoteProxy::new(connection, &self.client_one_way, &self.client_two_way)
    }
}

impl<SP: FromRemote, CP: FromRemote> Meta<SP, CP> {
    /// 客户端调用服务端所用的类型化代理。
    pub fn create_server_proxy(&self, connection: Connection) -> SP {
        SP::from_remote(self.server_remote(connection))
    }

    /// 服务端回调客户端所用的类型化代理。
    pub fn create_client_proxy(&self, connection: Connection) -> CP {
        CP::from_remote(self.client_remote(connection))
    }
}

/// [`Meta`] 的声明式构造器。
#[derive(Debug, Default, Clone)]
pub struct MetaBuilder {
    server_one_way: Vec<String>,
    server_two_way: Vec<String>,
    client_one_way: Vec<String>,
    client_two_way: Vec<String>,
}

impl MetaBuilder {
    pub fn server_one_way(mut self, name: impl Into<String>) -> Self {
        self.server_one_way.push(name.into());
        self
    }

    pub fn server_two_way(mut self, name: impl Into<String>) -> Self {
        self.server_two_way.push(name.into());
        self
    }

    pub fn client_one_way(mut self, name: impl Into<String>) -> Self {
        self.client_one_way.push(name.into());
        self
    }

    pub fn client_two_way(mut self, name: impl Into<String>) -> Self {
        self.client_two_way.push(name.into());
        self
    }

    pub fn build(self) -> Result<Meta, MetaError> {
        let mut seen = BTreeSet::new();
        for name in self
            .server_one_way
            .iter()
            .chain(&self.server_two_way)
            .chain(&self.client_one_way)
            .chain(&self.client_two_way)
        {
            if !seen.insert(name.as_str()) {
                return Err(MetaError::DuplicateCapability { name: name.clone() });
            }
        }
        Ok(Meta::from_sets(
            self.server_one_way,
            self.server_two_way,
            self.client_one_way,
            self.client_two_way,
        ))
    }
}

/// 限定于描述符某一侧能力的远程调用句柄。
#[derive(Clone)]
pub struct RemoteProxy {
    connection: Connection,
    one_way: Arc<BTreeSet<String>>,
    two_way: Arc<BTreeSet<String>>,
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("connection", &self.connection.id())
            .field("one_way", &self.one_way)
            .field("two_way", &self.two_way)
            .finish()
    }
}

impl RemoteProxy {
    fn new(connection: Connection, one_way: &[String], two_way: &[String]) -> Self {
        Self {
            connection,
            one_way: Arc::new(one_way.iter().cloned().collect()),
            two_way: Arc::new(two_way.iter().cloned().collect()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// 发送单向通知；名称必须是声明的单向能力。
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if !self.one_way.contains(method) {
            return Err(RpcError::not_declared(method));
        }
        self.connection.notify(method, params)
    }

    /// 发起双向调用；名称必须是声明的双向能力。
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if !self.two_way.contains(method) {
            return Err(RpcError::not_declared(method));
        }
        self.connection.request(method, params).await
    }

    /// 类型化的双向调用。
    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|err| RpcError::invalid_params(err.to_string()))?;
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|err| RpcError::internal(format!("unexpected reply to `{method}`: {err}")))
    }

    /// 类型化的单向通知。
    pub fn notify_typed<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<(), RpcError> {
        let params = serde_json::to_value(params).map_err(|err| RpcError::invalid_params(err.to_string()))?;
        self.notify(method, params)
    }
}

impl FromRemote for RemoteProxy {
    fn from_remote(remote: RemoteProxy) -> Self {
        remote
    }
}

impl<A: FromRemote, B: FromRemote> FromRemote for (A, B) {
    fn from_remote(remote: RemoteProxy) -> Self {
        (A::from_remote(remote.clone()), B::from_remote(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_must_be_unique_across_sets() {
        let err = Meta::builder()
            .server_two_way("module")
            .client_one_way("module")
            .build()
            .unwrap_err();
        assert_eq!(err, MetaError::DuplicateCapability { name: "module".into() });
    }

    #[test]
    fn capability_kind_reports_the_owning_set() {
        let meta = Meta::builder()
            .server_one_way("master")
            .server_two_way("module")
            .client_one_way("ready")
            .client_two_way("getContent")
            .build()
            .unwrap();
        assert_eq!(meta.capability_kind("master"), Some(CapabilityKind::ServerOneWay));
        assert_eq!(meta.capability_kind("getContent"), Some(CapabilityKind::ClientTwoWay));
        assert_eq!(meta.capability_kind("nope"), None);
        assert_eq!(
            meta.names().collect::<Vec<_>>(),
            vec!["master", "module", "ready", "getContent"]
        );
    }
}
