#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-hosting: 模块宿主的编排协调器、Worker 启动协议与共享的宿主基础设施。"]
//!
//! # 结构总览
//! - [`coordinator`]：主进程编排，依赖图驱动 Worker 拉起与公共监听的打开；
//! - [`worker`]：Worker 侧启动协议与模块上下文；
//! - [`protocol`]：主从之间的 RPC 描述符与类型化代理；
//! - [`graph`]：带事件的异步依赖图；
//! - [`discovery`]、[`config`]、[`settings`]：模块发现与配置；
//! - [`context`]、[`service`]、[`events`]：取代全局注册表的显式上下文。

pub mod catalog;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod events;
pub mod forward;
pub mod graph;
pub mod launcher;
pub mod protocol;
mod service;
pub mod settings;
pub mod worker;

pub use catalog::{MasterModule, ModuleCatalog, WorkerModule, master_fn, worker_fn};
pub use config::{ConfigHandle, ConfigStore, JsonConfigStore};
pub use context::{HostContext, MasterRouters};
pub use coordinator::{Coordinator, RunningHost};
pub use discovery::{DiscoveryOptions, ModuleDescriptor, discover};
pub use error::{BootstrapError, BoxError, ConfigError, GraphError, HostingError};
pub use events::{EventBus, MasterEvent, WorkerEvent};
pub use forward::{ForwardToWorker, LateBoundRoutes};
pub use graph::{DependencyGraph, GraphEvent, TaskStatus};
pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerExit, WorkerHandle, WorkerLauncher};
pub use service::{ServiceEntry, ServiceFactory, ServiceRegistrationError, ServiceRegistry};
pub use settings::HostSettings;
pub use worker::{WorkerContext, WorkerRuntime, bootstrap, bootstrap_with_io};
