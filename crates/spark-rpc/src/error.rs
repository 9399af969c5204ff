//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - [`RpcError`] 是线上错误槽的唯一形态 `{code, message, data?}`，远端失败与本地传输失败
//!   统一以它交还调用方，从不在本地抛出；
//! - [`MetaError`]、[`BindError`]、[`ConnectError`] 分别覆盖描述符构造、绑定与升级握手三个阶段。
//!
//! ## 设计要求（What）
//! - 每个错误都提供 `code()`，返回稳定的点分错误码（`rpc.*`）。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 线上错误槽。
///
/// 数值码沿用 JSON-RPC 约定：`-32700`～`-32600` 为协议错误，`-32000` 起为实现自定义错误。
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    code: i64,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const CONNECTION_CLOSED: i64 = -32000;
    pub const NOT_DECLARED: i64 = -32001;
    pub const FRAME_TOO_LARGE: i64 = -32002;
    pub const APPLICATION: i64 = -32099;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method `{method}` not found"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    pub fn connection_closed() -> Self {
        Self::new(Self::CONNECTION_CLOSED, "connection closed")
    }

    pub fn not_declared(method: &str) -> Self {
        Self::new(
            Self::NOT_DECLARED,
            format!("capability `{method}` is not declared for this side"),
        )
    }

    /// 对端发来的帧超过 `limit` 字节，连接随之关闭。
    pub fn frame_too_large(limit: usize) -> Self {
        Self::new(Self::FRAME_TOO_LARGE, format!("frame exceeds {limit} bytes"))
    }

    /// 业务层失败，通常由实现方返回。
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(Self::APPLICATION, message)
    }

    pub fn numeric_code(&self) -> i64 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// 稳定的点分错误码。
    pub fn code(&self) -> &'static str {
        match self.code {
            Self::PARSE_ERROR => "rpc.frame.parse",
            Self::INVALID_REQUEST => "rpc.frame.invalid",
            Self::METHOD_NOT_FOUND => "rpc.method.not_found",
            Self::INVALID_PARAMS => "rpc.params.invalid",
            Self::INTERNAL_ERROR => "rpc.internal",
            Self::CONNECTION_CLOSED => "rpc.connection.closed",
            Self::NOT_DECLARED => "rpc.capability.not_declared",
            Self::FRAME_TOO_LARGE => "rpc.frame.too_large",
            _ => "rpc.application",
        }
    }
}

/// 能力描述符构造失败。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetaError {
    /// 同一名称出现在多个能力集合中。
    #[error("capability `{name}` is declared more than once")]
    DuplicateCapability { name: String },
    /// 组合的两个描述符声明了同名能力。
    #[error("capability `{name}` is declared by both composed descriptors")]
    OverlappingCapability { name: String },
}

impl MetaError {
    pub fn code(&self) -> &'static str {
        match self {
            MetaError::DuplicateCapability { .. } => "rpc.meta.duplicate",
            MetaError::OverlappingCapability { .. } => "rpc.meta.overlap",
        }
    }
}

/// 把实现绑定到端点时的失败。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// 服务端声明的能力缺少本地实现。
    #[error("server capability `{name}` has no implementation")]
    MissingImplementation { name: String },
    /// 试图调用一个既未声明、也没有合成存根的能力。
    #[error("`{name}` is not a client capability of this descriptor")]
    NoStub { name: String },
}

impl BindError {
    pub fn code(&self) -> &'static str {
        match self {
            BindError::MissingImplementation { .. } => "rpc.bind.missing_implementation",
            BindError::NoStub { .. } => "rpc.bind.no_stub",
        }
    }
}

/// 客户端发起协议升级失败。
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid rpc url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to reach rpc endpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("http handshake failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("upgrade request could not be built: {0}")]
    Request(#[from] http::Error),
    #[error("rpc endpoint refused the upgrade with status {status}")]
    Rejected { status: u16 },
}

impl ConnectError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::InvalidUrl { .. } => "rpc.connect.invalid_url",
            ConnectError::Io(_) => "rpc.connect.io",
            ConnectError::Http(_) => "rpc.connect.http",
            ConnectError::Request(_) => "rpc.connect.request",
            ConnectError::Rejected { .. } => "rpc.connect.rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_omits_missing_data() {
        let json = serde_json::to_value(RpcError::method_not_found("x")).unwrap();
        assert_eq!(json["code"], -32601);
        assert!(json.get("data").is_none());
        assert_eq!(RpcError::method_not_found("x").code(), "rpc.method.not_found");
    }
}
