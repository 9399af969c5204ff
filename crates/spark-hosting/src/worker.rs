//! # worker 模块说明
//!
//! ## 角色定位（Why）
//! - 每个 Worker（子进程或进程内任务）启动时都走同一套协议向主进程登记自己；
//! - 主进程据此知道模块的配置切片、子 Worker 列表，以及是否需要在主进程侧加载配套入口。
//!
//! ## 协议步骤（How）
//! 1. 与主进程建立 RPC 连接，暴露 `getContent`、`after-master`、`ready`；
//! 2. 调用 `register` 把 `/api/<module>` 的流量转发到本地 `/api`；
//! 3. 调用 `module({module})`，取得 `{config, workers}`，配置切片经 [`WorkerContext::module_config`] 暴露；
//! 4. 构造经 RPC 读写主进程配置的 [`ConfigHandle`]；
//! 5. 依次加载子 Worker（空名与模块自身名跳过，每个入口每次启动最多一次），此阶段不允许宣告；
//! 6. 加载模块自身入口，期间可经 [`WorkerContext::announce_master`] 宣告一次；
//! 7. 若从未宣告，补发一次 `master(null)`。
//!
//! ## 契约（What）
//! - 宣告是一次性的：第二次调用记录守卫错误并被忽略，返回 `false`；
//! - “已加载”集合属于单次启动而非整个进程：一个 [`WorkerRuntime`] 对应一个 Worker 进程，
//!   进程内承载多个模块或同一模块重连时各自重新加载入口；
//! - 任何启动错误都以 [`BootstrapError`] 返回，由入口进程据 [`BootstrapError::EXIT_STATUS`] 退出。

use std::{
    collections::BTreeSet,
    fmt,
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use spark_router::{HandlerError, WorkerRequest, WorkerRouter};
use spark_rpc::{Connection, Implementation, RpcError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};
use url::Url;

use crate::{
    catalog::ModuleCatalog,
    config::{ConfigHandle, ConfigStore},
    error::{BootstrapError, ConfigError},
    events::{EventBus, WorkerEvent},
    protocol::{MasterProxy, MasterRegistration, ModuleRequest, RouteProxy, RouteRegistration, host_meta, names},
    service::ServiceRegistry,
};

/// 经 RPC 访问主进程配置的存储。
#[derive(Debug, Clone)]
pub struct RemoteConfigStore {
    master: MasterProxy,
}

impl RemoteConfigStore {
    pub fn new(master: MasterProxy) -> Self {
        Self { master }
    }
}

#[async_trait]
impl ConfigStore for RemoteConfigStore {
    async fn get(&self, key: Option<&str>) -> Result<Value, ConfigError> {
        Ok(self.master.get_config(key).await?)
    }

    async fn update(&self, value: Value, key: Option<&str>) -> Result<(), ConfigError> {
        Ok(self.master.update_config(value, key).await?)
    }
}

/// 一次性的主进程依赖宣告。
///
/// # 教案式说明
/// - **意图 (Why)**：主进程每个模块只等待一次宣告，重复宣告必须被拦下；
/// - **逻辑 (How)**：`AtomicBool` 从 armed 切换到 fired，只有赢得切换的调用会发出 `master`；
/// - **契约 (What)**：`master_path`/`worker_path` 相对 `from` 所在目录按词法解析，
///   不触碰文件系统。
#[derive(Clone)]
pub struct MasterAnnouncer {
    module: Arc<str>,
    fired: Arc<AtomicBool>,
    master: MasterProxy,
}

impl fmt::Debug for MasterAnnouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterAnnouncer")
            .field("module", &self.module)
            .field("fired", &self.fired())
            .finish()
    }
}

impl MasterAnnouncer {
    pub fn new(module: &str, master: MasterProxy) -> Self {
        Self {
            module: Arc::from(module),
            fired: Arc::new(AtomicBool::new(false)),
            master,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn arm_once(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 宣告主进程依赖；已宣告过则记录守卫错误并返回 `false`。
    pub fn announce(&self, from: &str, master_path: Option<&str>, worker_path: Option<&str>) -> bool {
        if !self.arm_once() {
            error!(target: "spark_hosting::worker", module = %self.module, from, "master announcement already sent");
            return false;
        }
        let registration = MasterRegistration {
            master_path: master_path.map(|path| resolve_relative(from, path)),
            worker_path: worker_path.map(|path| resolve_relative(from, path)),
        };
        debug!(target: "spark_hosting::worker", module = %self.module, registration = ?registration, "announcing master");
        self.send(Some(&registration));
        true
    }

    /// 未宣告时补发 `master(null)`。
    pub fn announce_default(&self) -> bool {
        if !self.arm_once() {
            return false;
        }
        debug!(target: "spark_hosting::worker", module = %self.module, "no master announced, sending default");
        self.send(None);
        true
    }

    fn send(&self, registration: Option<&MasterRegistration>) {
        if let Err(err) = self.master.master(registration) {
            error!(target: "spark_hosting::worker", module = %self.module, code = err.code(), error = %err, "master announcement not delivered");
        }
    }
}

/// 以 `from` 的父目录为基准词法解析 `path`。
pub fn resolve_relative(from: &str, path: &str) -> String {
    let base = Path::new(from).parent().unwrap_or(Path::new(""));
    let mut resolved = PathBuf::new();
    for component in base.join(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved.to_string_lossy().into_owned()
}

/// 模块入口可见的 Worker 上下文。
#[derive(Clone)]
pub struct WorkerContext {
    module: Arc<str>,
    module_config: Arc<Value>,
    router: WorkerRouter,
    config: ConfigHandle,
    services: ServiceRegistry,
    events: EventBus<WorkerEvent>,
    master: MasterProxy,
    route: RouteProxy,
    announcer: Option<MasterAnnouncer>,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("module", &self.module)
            .field("announcer", &self.announcer)
            .finish()
    }
}

impl WorkerContext {
    /// 本 Worker 承载的模块名。
    pub fn module(&self) -> &str {
        &self.module
    }

    /// 主进程在 `module` 回复中下发的本模块配置切片。
    pub fn module_config(&self) -> &Value {
        &self.module_config
    }

    pub fn router(&self) -> &WorkerRouter {
        &self.router
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn events(&self) -> &EventBus<WorkerEvent> {
        &self.events
    }

    pub fn master(&self) -> &MasterProxy {
        &self.master
    }

    /// 请求主进程把 `path` 下的流量转发到本 Worker 的 `remap`。
    pub fn register_route(&self, path: &str, remap: &str) -> Result<(), RpcError> {
        self.route.register(&RouteRegistration {
            path: path.to_owned(),
            remap: remap.to_owned(),
        })
    }

    /// `name` 是否为本 Worker 承载的模块；加载子 Worker 期间恒为 `false`。
    pub fn is_module(&self, name: &str) -> bool {
        self.announcer.is_some() && *self.module == *name
    }

    /// 宣告主进程依赖，路径相对 `from` 解析。
    ///
    /// 只有模块自身入口的首次调用生效；子 Worker 调用与重复调用返回 `false`。
    pub fn announce_master(&self, from: &str, master_path: Option<&str>, worker_path: Option<&str>) -> bool {
        match &self.announcer {
            Some(announcer) => announcer.announce(from, master_path, worker_path),
            None => {
                debug!(target: "spark_hosting::worker", module = %self.module, from, "not the current module path. Ignoring");
                false
            }
        }
    }

    fn with_announcer(&self, announcer: Option<MasterAnnouncer>) -> Self {
        Self {
            announcer,
            ..self.clone()
        }
    }
}

/// 启动完成的 Worker。
#[derive(Debug)]
pub struct WorkerRuntime {
    context: WorkerContext,
    connection: Connection,
}

impl WorkerRuntime {
    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// 主进程连接关闭时返回。
    pub async fn closed(&self) {
        self.connection.closed().await;
    }
}

/// 经 HTTP 协议升级连接 `master_url` 并执行启动协议。
pub async fn bootstrap(module: &str, master_url: &Url, catalog: ModuleCatalog) -> Result<WorkerRuntime, BootstrapError> {
    let io = spark_rpc::upgrade::connect(master_url).await?;
    info!(target: "spark_hosting::worker", module, url = %master_url, "worker connected");
    bootstrap_with_io(module, io, catalog).await
}

/// 在现成的双工 I/O 上执行启动协议。
pub async fn bootstrap_with_io<IO>(module: &str, io: IO, catalog: ModuleCatalog) -> Result<WorkerRuntime, BootstrapError>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let host = host_meta()?;
    let events = EventBus::new();
    let router = WorkerRouter::new();

    let lifecycle = {
        let after_master = events.clone();
        let ready = events.clone();
        Implementation::new()
            .one_way(names::AFTER_MASTER, move |_, _| {
                let events = after_master.clone();
                async move {
                    events.emit(WorkerEvent::AfterMaster);
                }
            })
            .one_way(names::READY, move |_, _| {
                let events = ready.clone();
                async move {
                    events.emit(WorkerEvent::Ready);
                }
            })
    };
    let content = {
        let router = router.clone();
        Implementation::new().typed_two_way(names::GET_CONTENT, move |request: WorkerRequest, _| {
            let router = router.clone();
            async move { router.handle(request).await.map_err(|err| handler_error_to_rpc(&err)) }
        })
    };

    let client = host.create_client(lifecycle, content).connect_io(io);
    let (master, route) = client.proxy().clone();

    route.register(&RouteRegistration {
        path: format!("/api/{module}"),
        remap: "/api".to_owned(),
    })?;
    let reply = master
        .module(&ModuleRequest {
            module: module.to_owned(),
        })
        .await?;
    debug!(target: "spark_hosting::worker", module, workers = ?reply.workers, "module description received");

    let base = WorkerContext {
        module: Arc::from(module),
        module_config: Arc::new(reply.config),
        router,
        config: ConfigHandle::new(Arc::new(RemoteConfigStore::new(master.clone()))),
        services: ServiceRegistry::new(),
        events,
        master: master.clone(),
        route,
        announcer: None,
    };

    let mut loaded = BTreeSet::new();
    for sub in &reply.workers {
        if sub.is_empty() {
            continue;
        }
        if sub == module {
            debug!(target: "spark_hosting::worker", module, "module listed as its own sub-worker, loading it as the module");
            continue;
        }
        debug!(target: "spark_hosting::worker", module, worker = %sub, "loading sub-worker");
        load(&catalog, sub, &base, &mut loaded).await?;
    }

    let announcer = MasterAnnouncer::new(module, master);
    let context = base.with_announcer(Some(announcer.clone()));
    load(&catalog, module, &context, &mut loaded).await?;
    announcer.announce_default();
    info!(target: "spark_hosting::worker", module, "worker started");

    Ok(WorkerRuntime {
        context,
        connection: client.connection().clone(),
    })
}

async fn load(
    catalog: &ModuleCatalog,
    name: &str,
    ctx: &WorkerContext,
    loaded: &mut BTreeSet<String>,
) -> Result<(), BootstrapError> {
    if !loaded.insert(name.to_owned()) {
        return Ok(());
    }
    let entry = catalog
        .worker(name)
        .ok_or_else(|| BootstrapError::UnknownModule(name.to_owned()))?;
    entry
        .load(ctx)
        .await
        .map_err(|source| BootstrapError::ModuleFailed {
            module: name.to_owned(),
            source,
        })
}

/// 未被 Worker 错误层消化的错误写入回复的错误槽。
fn handler_error_to_rpc(err: &HandlerError) -> RpcError {
    RpcError::application(err.message()).with_data(err.to_json())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_resolve_against_the_announcing_location() {
        assert_eq!(resolve_relative("core/web/index", "./master"), "core/web/master");
        assert_eq!(resolve_relative("core/web/index", "../shared/master"), "core/shared/master");
        assert_eq!(resolve_relative("index", "master"), "master");
        assert_eq!(resolve_relative("/srv/app/index", "/opt/master"), "/opt/master");
    }
}
