//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 宿主侧四类失败各自成型：编排装配（[`HostingError`]）、依赖图（[`GraphError`]）、
//!   配置读写（[`ConfigError`]）与 Worker 启动（[`BootstrapError`]）；
//! - 每个错误都带稳定点分错误码，日志与 RPC 错误槽中原样输出。
//!
//! ## 设计要求（What）
//! - [`BootstrapError`] 是进程级致命错误，入口据 [`BootstrapError::EXIT_STATUS`] 退出；
//! - 其余错误均可恢复，由调用方决定记录或上抛。

use std::{io, path::PathBuf};

use spark_rpc::{BindError, ConnectError, MetaError, RpcError};
use thiserror::Error;

/// 任务体与模块入口返回的动态错误。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 编排装配阶段的错误。
#[derive(Debug, Error)]
pub enum HostingError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{path}` is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{path}` is not a valid package manifest: {reason}")]
    Manifest { path: PathBuf, reason: String },
    #[error("failed to bind {role} listener on `{address}`: {source}")]
    Listener {
        role: &'static str,
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch worker for `{module}`: {source}")]
    Launch {
        module: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid management url: {0}")]
    Url(#[from] url::ParseError),
}

impl HostingError {
    pub fn code(&self) -> &'static str {
        match self {
            HostingError::Io { .. } => "hosting.io",
            HostingError::Json { .. } => "hosting.json",
            HostingError::Manifest { .. } => "hosting.manifest",
            HostingError::Listener { .. } => "hosting.listener",
            HostingError::Launch { .. } => "hosting.launch",
            HostingError::Meta(err) => err.code(),
            HostingError::Bind(err) => err.code(),
            HostingError::Graph(err) => err.code(),
            HostingError::Config(err) => err.code(),
            HostingError::Url(_) => "hosting.url",
        }
    }
}

/// 依赖图错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("task `{task}` is already registered")]
    DuplicateTask { task: String },
    #[error("task `{missing}` required by `{task}` was never registered")]
    TaskNotFound { task: String, missing: String },
    #[error("task `{task}` failed: {message}")]
    TaskFailed { task: String, message: String },
    #[error("dependency cycle through `{task}`")]
    Cycle { task: String },
    #[error("task `{task}` is not registered")]
    UnknownTask { task: String },
}

impl GraphError {
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::DuplicateTask { .. } => "graph.task.duplicate",
            GraphError::TaskNotFound { .. } => "graph.task.not_found",
            GraphError::TaskFailed { .. } => "graph.task.failed",
            GraphError::Cycle { .. } => "graph.task.cycle",
            GraphError::UnknownTask { .. } => "graph.task.unknown",
        }
    }
}

/// 配置读写错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config key `{key}` does not address an object")]
    NotAnObject { key: String },
    #[error("failed to persist config to `{path}`: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Remote(#[from] RpcError),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::NotAnObject { .. } => "config.key.not_object",
            ConfigError::Persist { .. } => "config.persist",
            ConfigError::Encode(_) => "config.encode",
            ConfigError::Remote(_) => "config.remote",
        }
    }
}

/// Worker 启动期间的致命错误。
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("missing required argument `{0}`")]
    MissingArgument(&'static str),
    #[error("invalid master url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("master call failed: {0}")]
    Rpc(#[from] RpcError),
    #[error("module `{0}` is not present in the module catalog")]
    UnknownModule(String),
    #[error("module `{module}` failed to load: {source}")]
    ModuleFailed {
        module: String,
        #[source]
        source: BoxError,
    },
}

impl BootstrapError {
    /// Worker 因启动失败退出时使用的进程状态码（EX_SOFTWARE）。
    pub const EXIT_STATUS: i32 = 70;

    pub fn code(&self) -> &'static str {
        match self {
            BootstrapError::MissingArgument(_) => "bootstrap.argument.missing",
            BootstrapError::InvalidUrl { .. } => "bootstrap.argument.url",
            BootstrapError::Connect(err) => err.code(),
            BootstrapError::Meta(err) => err.code(),
            BootstrapError::Rpc(err) => err.code(),
            BootstrapError::UnknownModule(_) => "bootstrap.module.unknown",
            BootstrapError::ModuleFailed { .. } => "bootstrap.module.failed",
        }
    }
}
