//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 统一描述路由分发期间可能出现的两类错误：处理器自身抛出的 [`HandlerError`]，
//!   以及注册阶段的 [`RouteError`]；
//! - 两者都携带稳定错误码（`router.*`），便于在 HTTP 500 响应体与 Worker 回复的错误槽中原样输出。
//!
//! ## 设计要求（What）
//! - 错误值必须 `Send + Sync + 'static`，以便跨越 `await` 点在中间件链中传播；
//! - `HandlerError` 可序列化为 JSON 错误体 `{code, message, status}`。

use std::{borrow::Cow, fmt, sync::Arc};

use serde::Serialize;
use thiserror::Error;

/// 处理器在分发链中抛出的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：中间件以 [`Flow::Fail`](crate::Flow::Fail) 上报失败后，路由器需要把错误
///   交给最近的错误处理层；若无人接手，HTTP 侧转为 500，Worker 侧写入回复的错误槽。
/// - **契约 (What)**：
///   - `code`：稳定错误码，例如 `router.handler.failed`；
///   - `message`：人类可读描述；
///   - `status`：建议的 HTTP 状态码，缺省为 500；
///   - `source`：可选的底层错误，仅用于日志，不参与序列化。
#[derive(Clone)]
pub struct HandlerError {
    code: Cow<'static, str>,
    message: String,
    status: u16,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HandlerError {
    /// 以错误码与描述构造错误，状态码默认为 500。
    pub fn new(code: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: 500,
            source: None,
        }
    }

    /// 以通用错误码 `router.handler.failed` 包装一段描述。
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(codes::HANDLER_FAILED, message)
    }

    /// 包装任意底层错误，保留其 `Display` 作为描述。
    pub fn from_source<E>(code: impl Into<Cow<'static, str>>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            code: code.into(),
            message: source.to_string(),
            status: 500,
            source: Some(Arc::new(source)),
        }
    }

    /// 覆盖建议状态码。
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// 生成写入响应流的 JSON 错误体。
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(ErrorBody {
            code: &self.code,
            message: &self.message,
            status: self.status,
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    status: u16,
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("status", &self.status)
            .finish()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

/// 路由注册阶段的错误。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// 动词表中不存在该 HTTP 方法。
    #[error("unknown HTTP verb `{verb}`")]
    UnknownVerb { verb: String },
}

impl RouteError {
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::UnknownVerb { .. } => codes::UNKNOWN_VERB,
        }
    }
}

/// 路由引擎使用的稳定错误码。
pub mod codes {
    pub const HANDLER_FAILED: &str = "router.handler.failed";
    pub const HANDLER_PANICKED: &str = "router.handler.panicked";
    pub const BODY_UNREADABLE: &str = "router.request.body";
    pub const UNKNOWN_VERB: &str = "router.verb.unknown";
    pub const RESPONSE_ENCODE: &str = "router.response.encode";
}
