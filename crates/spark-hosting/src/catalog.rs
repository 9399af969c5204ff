//! 模块目录：模块名到入口的静态映射。
//!
//! 编译产物无法在运行时按路径加载，模块因此在进程启动前把入口登记到 [`ModuleCatalog`]；
//! “加载”一个模块即调用其入口一次。Worker 入口按模块名登记，主进程入口按宣告的
//! `masterPath` 登记。

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{context::HostContext, error::BoxError, protocol::MasterRegistration, worker::WorkerContext};

/// Worker 进程内的模块入口。
#[async_trait]
pub trait WorkerModule: Send + Sync + 'static {
    async fn load(&self, ctx: &WorkerContext) -> Result<(), BoxError>;
}

/// 主进程内的模块入口，在对应 Worker 宣告 `masterPath` 后调用。
#[async_trait]
pub trait MasterModule: Send + Sync + 'static {
    async fn start(&self, ctx: &HostContext, registration: &MasterRegistration) -> Result<(), BoxError>;
}

/// 以闭包实现 [`WorkerModule`]，闭包写作 `|ctx| Box::pin(async move { ... })`。
pub struct WorkerFn<F> {
    f: F,
}

pub fn worker_fn<F>(f: F) -> WorkerFn<F>
where
    F: for<'a> Fn(&'a WorkerContext) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync + 'static,
{
    WorkerFn { f }
}

#[async_trait]
impl<F> WorkerModule for WorkerFn<F>
where
    F: for<'a> Fn(&'a WorkerContext) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync + 'static,
{
    async fn load(&self, ctx: &WorkerContext) -> Result<(), BoxError> {
        (self.f)(ctx).await
    }
}

/// 以闭包实现 [`MasterModule`]。
pub struct MasterFn<F> {
    f: F,
}

pub fn master_fn<F>(f: F) -> MasterFn<F>
where
    F: for<'a> Fn(&'a HostContext, &'a MasterRegistration) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    MasterFn { f }
}

#[async_trait]
impl<F> MasterModule for MasterFn<F>
where
    F: for<'a> Fn(&'a HostContext, &'a MasterRegistration) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    async fn start(&self, ctx: &HostContext, registration: &MasterRegistration) -> Result<(), BoxError> {
        (self.f)(ctx, registration).await
    }
}

/// 模块入口目录，克隆共享同一组入口。
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    workers: BTreeMap<String, Arc<dyn WorkerModule>>,
    masters: BTreeMap<String, Arc<dyn MasterModule>>,
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .field("masters", &self.masters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 Worker 入口，同名时后者覆盖前者。
    pub fn with_worker(mut self, name: impl Into<String>, module: impl WorkerModule) -> Self {
        self.workers.insert(name.into(), Arc::new(module));
        self
    }

    /// 以 `masterPath` 登记主进程入口。
    pub fn with_master(mut self, path: impl Into<String>, module: impl MasterModule) -> Self {
        self.masters.insert(path.into(), Arc::new(module));
        self
    }

    pub fn worker(&self, name: &str) -> Option<Arc<dyn WorkerModule>> {
        self.workers.get(name).cloned()
    }

    pub fn master(&self, path: &str) -> Option<Arc<dyn MasterModule>> {
        self.masters.get(path).cloned()
    }

    pub fn worker_names(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }
}
