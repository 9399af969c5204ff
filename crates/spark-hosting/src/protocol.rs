//! # protocol 模块说明
//!
//! 主进程与 Worker 之间的两套能力描述及其载荷：
//! - **模块协议**（[`module_meta`]）：Worker 调用 `module`/`getConfig`/`updateConfig`/`master`，
//!   主进程回推 `after-master` 与 `ready`；
//! - **路由协议**（[`router_meta`]）：Worker 以 `register` 申请转发前缀，主进程以
//!   `getContent` 把 HTTP 请求转交给 Worker。
//!
//! 两者经 [`host_meta`] 组合为 [`DualMetadata`]，共享 `/api/manage` 上的一条连接。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spark_router::{CallbackResponse, WorkerRequest};
use spark_rpc::{DualMetadata, FromRemote, Meta, MetaError, RemoteProxy, RpcError};

/// 管理入口挂载路径。
pub const MANAGEMENT_PATH: &str = "/api/manage";

pub mod names {
    pub const MODULE: &str = "module";
    pub const MASTER: &str = "master";
    pub const GET_CONFIG: &str = "getConfig";
    pub const UPDATE_CONFIG: &str = "updateConfig";
    pub const AFTER_MASTER: &str = "after-master";
    pub const READY: &str = "ready";
    pub const REGISTER: &str = "register";
    pub const GET_CONTENT: &str = "getContent";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequest {
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleReply {
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub workers: Vec<String>,
}

/// Worker 的主进程依赖声明，路径已相对声明方位置解析。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterRegistration {
    #[serde(default)]
    pub master_path: Option<String>,
    #[serde(default)]
    pub worker_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigQuery {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub key: Option<String>,
    pub value: Value,
}

/// 转发申请：`path` 下的请求改写到 `remap` 前缀后交给申请方。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRegistration {
    pub path: String,
    pub remap: String,
}

pub type ModuleMeta = Meta<MasterProxy, WorkerProxy>;
pub type RouterMeta = Meta<RouteProxy, ContentProxy>;
pub type HostMeta = DualMetadata<MasterProxy, WorkerProxy, RouteProxy, ContentProxy>;

pub fn module_meta() -> Result<ModuleMeta, MetaError> {
    Ok(Meta::builder()
        .server_two_way(names::MODULE)
        .server_two_way(names::GET_CONFIG)
        .server_two_way(names::UPDATE_CONFIG)
        .server_one_way(names::MASTER)
        .client_one_way(names::AFTER_MASTER)
        .client_one_way(names::READY)
        .build()?
        .with_proxies())
}

pub fn router_meta() -> Result<RouterMeta, MetaError> {
    Ok(Meta::builder()
        .server_one_way(names::REGISTER)
        .client_two_way(names::GET_CONTENT)
        .build()?
        .with_proxies())
}

pub fn host_meta() -> Result<HostMeta, MetaError> {
    DualMetadata::new(module_meta()?, router_meta()?)
}

/// Worker 调用主进程模块协议的代理。
#[derive(Debug, Clone)]
pub struct MasterProxy {
    remote: RemoteProxy,
}

impl FromRemote for MasterProxy {
    fn from_remote(remote: RemoteProxy) -> Self {
        Self { remote }
    }
}

impl MasterProxy {
    pub async fn module(&self, request: &ModuleRequest) -> Result<ModuleReply, RpcError> {
        self.remote.call_typed(names::MODULE, request).await
    }

    /// 宣告主进程依赖；`None` 表示没有需要主进程加载的部分。
    pub fn master(&self, registration: Option<&MasterRegistration>) -> Result<(), RpcError> {
        self.remote.notify_typed(names::MASTER, &registration)
    }

    pub async fn get_config(&self, key: Option<&str>) -> Result<Value, RpcError> {
        let query = ConfigQuery {
            key: key.map(str::to_owned),
        };
        self.remote.call_typed(names::GET_CONFIG, &query).await
    }

    pub async fn update_config(&self, value: Value, key: Option<&str>) -> Result<(), RpcError> {
        let update = ConfigUpdate {
            key: key.map(str::to_owned),
            value,
        };
        let _: Value = self.remote.call_typed(names::UPDATE_CONFIG, &update).await?;
        Ok(())
    }
}

/// Worker 调用主进程路由协议的代理。
#[derive(Debug, Clone)]
pub struct RouteProxy {
    remote: RemoteProxy,
}

impl FromRemote for RouteProxy {
    fn from_remote(remote: RemoteProxy) -> Self {
        Self { remote }
    }
}

impl RouteProxy {
    pub fn register(&self, registration: &RouteRegistration) -> Result<(), RpcError> {
        self.remote.notify_typed(names::REGISTER, registration)
    }
}

/// 主进程回推 Worker 生命周期信号的代理。
#[derive(Debug, Clone)]
pub struct WorkerProxy {
    remote: RemoteProxy,
}

impl FromRemote for WorkerProxy {
    fn from_remote(remote: RemoteProxy) -> Self {
        Self { remote }
    }
}

impl WorkerProxy {
    pub fn after_master(&self) -> Result<(), RpcError> {
        self.remote.notify(names::AFTER_MASTER, Value::Null)
    }

    pub fn ready(&self) -> Result<(), RpcError> {
        self.remote.notify(names::READY, Value::Null)
    }
}

/// 主进程把 HTTP 请求转交给 Worker 的代理。
#[derive(Debug, Clone)]
pub struct ContentProxy {
    remote: RemoteProxy,
}

impl FromRemote for ContentProxy {
    fn from_remote(remote: RemoteProxy) -> Self {
        Self { remote }
    }
}

impl ContentProxy {
    /// 转交请求；Worker 侧无人处理时返回 `None`。
    pub async fn get_content(&self, request: &WorkerRequest) -> Result<Option<CallbackResponse>, RpcError> {
        self.remote.call_typed(names::GET_CONTENT, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_meta_splits_capabilities_between_sides() {
        let host = host_meta().unwrap();
        let meta = host.meta();
        assert_eq!(meta.server_one_way(), ["master", "register"]);
        assert_eq!(meta.server_two_way(), ["module", "getConfig", "updateConfig"]);
        assert_eq!(meta.client_one_way(), ["after-master", "ready"]);
        assert_eq!(meta.client_two_way(), ["getContent"]);
    }

    #[test]
    fn master_registration_uses_camel_case() {
        let registration = MasterRegistration {
            master_path: Some("/a/master".into()),
            worker_path: None,
        };
        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["masterPath"], "/a/master");
        assert!(json["workerPath"].is_null());
    }
}
