//! 线上帧格式：每行一个 JSON 对象。
//!
//! - 请求：`{"id": n, "method": "...", "params": ...}`
//! - 通知：`{"method": "...", "params": ...}`
//! - 成功回复：`{"id": n, "result": ...}`
//! - 失败回复：`{"id": n, "error": {"code": .., "message": .., "data": ..}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
    Success {
        id: u64,
        result: Value,
    },
    Failure {
        id: u64,
        error: RpcError,
    },
}

impl Frame {
    pub fn reply(id: u64, outcome: Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => Frame::Success { id, result },
            Err(error) => Frame::Failure { id, error },
        }
    }

    pub fn encode(&self) -> Result<String, RpcError> {
        serde_json::to_string(self).map_err(|err| RpcError::internal(err.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self, RpcError> {
        serde_json::from_str(line).map_err(|err| RpcError::new(RpcError::PARSE_ERROR, err.to_string()))
    }
}
