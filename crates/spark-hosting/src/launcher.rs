//! Worker 启动器。
//!
//! 主进程只关心两件事：Worker 已被拉起，以及它何时退出。前者由 `launch` 的返回值表达，
//! 后者经 [`WorkerHandle`] 观察，宣告之前退出的 Worker 会让对应的模块任务失败。

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{process::Command, sync::oneshot};
use tracing::{error, info};
use url::Url;

use crate::{catalog::ModuleCatalog, error::BoxError, worker};

/// Worker 的退出情况。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Finished,
    Failed(String),
}

/// 已启动 Worker 的退出观察句柄。
#[derive(Debug)]
pub struct WorkerHandle {
    exit: oneshot::Receiver<WorkerExit>,
}

impl WorkerHandle {
    pub fn new(exit: oneshot::Receiver<WorkerExit>) -> Self {
        Self { exit }
    }

    /// 等待退出；观察端被丢弃视为正常结束。
    pub async fn exited(&mut self) -> WorkerExit {
        (&mut self.exit).await.unwrap_or(WorkerExit::Finished)
    }
}

/// Worker 启动契约。
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, module: &str, master_url: &Url) -> Result<WorkerHandle, BoxError>;
}

/// 以子进程运行 Worker：`<program> worker <module> <master-url>`。
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// 重新执行当前可执行文件。
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, module: &str, master_url: &Url) -> Result<WorkerHandle, BoxError> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg(module)
            .arg(master_url.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(target: "spark_hosting::coordinator", module, pid = ?child.id(), "worker process spawned");

        let (tx, rx) = oneshot::channel();
        let module = module.to_owned();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) if status.success() => WorkerExit::Finished,
                Ok(status) => WorkerExit::Failed(status.to_string()),
                Err(err) => WorkerExit::Failed(err.to_string()),
            };
            match &exit {
                WorkerExit::Finished => info!(target: "spark_hosting::coordinator", module = %module, "worker process exited"),
                WorkerExit::Failed(reason) => {
                    error!(target: "spark_hosting::coordinator", module = %module, reason = %reason, "worker process failed")
                }
            }
            let _ = tx.send(exit);
        });
        Ok(WorkerHandle::new(rx))
    }
}

/// 在当前运行时上执行 Worker 启动协议，供单进程部署与测试使用。
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    catalog: ModuleCatalog,
}

impl InProcessLauncher {
    pub fn new(catalog: ModuleCatalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, module: &str, master_url: &Url) -> Result<WorkerHandle, BoxError> {
        let (tx, rx) = oneshot::channel();
        let catalog = self.catalog.clone();
        let module = module.to_owned();
        let url = master_url.clone();
        tokio::spawn(async move {
            let exit = match worker::bootstrap(&module, &url, catalog).await {
                Ok(runtime) => {
                    runtime.closed().await;
                    WorkerExit::Finished
                }
                Err(err) => {
                    error!(target: "spark_hosting::worker", module = %module, code = err.code(), error = %err, "worker bootstrap failed");
                    WorkerExit::Failed(err.to_string())
                }
            };
            let _ = tx.send(exit);
        });
        Ok(WorkerHandle::new(rx))
    }
}
