//! # coordinator 模块说明
//!
//! ## 角色定位（Why）
//! - 主进程的编排核心：发现模块、拉起 Worker、驱动依赖图，并在整张图完成之后才打开公共监听；
//! - 主从之间的 RPC 端点挂在独立的管理监听上，因此 Worker 可以在公共入口开放之前完成登记。
//!
//! ## 状态推进（How）
//! 1. 绑定管理监听，在 `/api/manage` 上以 [`host_meta`] 暴露模块协议与路由协议；
//! 2. 每个模块注册 `<module>#master` 任务，依赖其 `workers` 与 `dependencies` 对应的 `#master` 任务；
//!    任务体拉起 Worker、等待宣告、按需启动主进程入口，最后回推 `after-master`；
//! 3. 根任务 `default` 依赖全部模块任务，任务体挂载兜底路由与终端错误层、绑定公共监听、
//!    广播 [`MasterEvent::Ready`] 并向每个 Worker 回推 `ready`；
//! 4. 启动 `default`。
//!
//! ## 契约（What）
//! - 公共监听的第一个连接一定晚于全部模块任务完成；
//! - 模块失败只中止其分支并记录 `task_err`，协调器进程本身不受影响。

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use serde_json::{Value, json};
use spark_router::{
    Flow, HttpRouter, RoutedRequest,
    http::{error_handler_fn, handler_fn},
};
use spark_rpc::{BoundServer, Connection, Implementation, RpcError};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    catalog::ModuleCatalog,
    config::{ConfigStore, JsonConfigStore},
    context::HostContext,
    discovery::{DiscoveryOptions, ModuleDescriptor, discover},
    error::{BoxError, ConfigError, GraphError, HostingError},
    events::MasterEvent,
    forward::ForwardToWorker,
    graph::DependencyGraph,
    launcher::WorkerLauncher,
    protocol::{
        ConfigQuery, ConfigUpdate, ContentProxy, MANAGEMENT_PATH, MasterRegistration, ModuleReply, ModuleRequest,
        RouteRegistration, WorkerProxy, host_meta, names, router_meta,
    },
    settings::HostSettings,
};

/// 根任务名。
pub const ROOT_TASK: &str = "default";
/// 宿主自身的占位任务，模块可以声明依赖 `spark-modhost`。
pub const HOST_TASK: &str = "spark-modhost#master";
pub const CONFIG_FILE: &str = "config.json";

/// 模块对应的图任务名。
pub fn master_task(module: &str) -> String {
    format!("{module}#master")
}

type Announcements = Arc<Mutex<BTreeMap<String, oneshot::Sender<Option<MasterRegistration>>>>>;
type HostServer = BoundServer<(WorkerProxy, ContentProxy)>;

/// 编排协调器。
pub struct Coordinator {
    context: HostContext,
    modules: Vec<ModuleDescriptor>,
    catalog: ModuleCatalog,
    launcher: Arc<dyn WorkerLauncher>,
    graph: DependencyGraph,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("modules", &self.modules.iter().map(|m| &m.name).collect::<Vec<_>>())
            .field("graph", &self.graph)
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        context: HostContext,
        modules: Vec<ModuleDescriptor>,
        catalog: ModuleCatalog,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            context,
            modules,
            catalog,
            launcher,
            graph: DependencyGraph::new(),
        }
    }

    /// 从配置文件与发现输入构造协调器。
    pub async fn from_files(
        config_path: &Path,
        discovery: &DiscoveryOptions,
        catalog: ModuleCatalog,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, HostingError> {
        let store = Arc::new(JsonConfigStore::load(config_path).await?);
        let snapshot = store.snapshot();
        let settings = HostSettings::from_config(&snapshot);
        let modules = discover(discovery, &snapshot).await?;
        info!(target: "spark_hosting::coordinator", modules = ?modules.iter().map(|m| &m.name).collect::<Vec<_>>(), "modules discovered");
        Ok(Self::new(HostContext::new(settings, store), modules, catalog, launcher))
    }

    /// 以 `root` 下的 `config.json`、`sources.list` 构造协调器。
    pub async fn from_directory(
        root: impl Into<PathBuf>,
        catalog: ModuleCatalog,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, HostingError> {
        let root = root.into();
        Self::from_files(&root.join(CONFIG_FILE), &DiscoveryOptions::new(&root), catalog, launcher).await
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// 依赖图，启动前可在其上注册监听者。
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    /// 打开管理入口、注册全部任务并启动根任务。
    pub async fn start(self) -> Result<RunningHost, HostingError> {
        let Self {
            context,
            modules,
            catalog,
            launcher,
            graph,
        } = self;
        let shutdown = CancellationToken::new();
        let announcements: Announcements = Arc::default();
        let descriptors: Arc<BTreeMap<String, ModuleDescriptor>> = Arc::new(
            modules
                .iter()
                .map(|module| (module.name.clone(), module.clone()))
                .collect(),
        );

        let management = HttpRouter::new();
        let server = host_meta()?.create_server(
            &management,
            MANAGEMENT_PATH,
            module_api(&context, descriptors, Arc::clone(&announcements)),
            router_api(&context)?,
        )?;
        let management_addr = bind_and_serve("management", &context.settings().management, &management, &shutdown).await?;
        let master_url = Url::parse(&format!("http://{management_addr}{MANAGEMENT_PATH}"))?;
        info!(target: "spark_hosting::coordinator", url = %master_url, "management endpoint listening");

        graph.add(HOST_TASK, Vec::<String>::new(), || async { Ok::<(), BoxError>(()) })?;
        for module in &modules {
            let mut seen = BTreeSet::new();
            let task = ModuleTask {
                module: module.name.clone(),
                master_url: master_url.clone(),
                context: context.clone(),
                catalog: catalog.clone(),
                launcher: Arc::clone(&launcher),
                announcements: Arc::clone(&announcements),
                server: server.clone(),
            };
            let deps: Vec<String> = module
                .workers
                .iter()
                .chain(&module.dependencies)
                .filter(|dep| !dep.is_empty() && seen.insert(dep.as_str()))
                .map(|dep| master_task(dep))
                .collect();
            debug!(target: "spark_hosting::coordinator", module = %module.name, deps = ?deps, "module task registered");
            graph.add(master_task(&module.name), deps, move || task.run())?;
        }

        let public_addr = Arc::new(OnceLock::new());
        let root = RootTask {
            context: context.clone(),
            server: server.clone(),
            shutdown: shutdown.clone(),
            public_addr: Arc::clone(&public_addr),
        };
        graph.add(
            ROOT_TASK,
            modules.iter().map(|module| master_task(&module.name)),
            move || root.run(),
        )?;
        graph.start(ROOT_TASK)?;

        Ok(RunningHost {
            context,
            graph,
            server,
            management_addr,
            master_url,
            public_addr,
            shutdown,
        })
    }
}

async fn bind_and_serve(
    role: &'static str,
    address: &str,
    router: &HttpRouter,
    shutdown: &CancellationToken,
) -> Result<SocketAddr, HostingError> {
    let listener_error = |source| HostingError::Listener {
        role,
        address: address.to_owned(),
        source,
    };
    let listener = TcpListener::bind(address).await.map_err(listener_error)?;
    let local = listener.local_addr().map_err(listener_error)?;
    let router = router.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = router.attach_to(listener, shutdown).await {
            error!(target: "spark_hosting::coordinator", role, error = %err, "listener stopped");
        }
    });
    Ok(local)
}

/// 模块协议的主进程实现：`module`、`master`、`getConfig`、`updateConfig`。
fn module_api(
    context: &HostContext,
    modules: Arc<BTreeMap<String, ModuleDescriptor>>,
    announcements: Announcements,
) -> Implementation {
    let on_module = context.clone();
    let on_get = context.store().clone();
    let on_update = context.store().clone();
    Implementation::new()
        .typed_two_way(names::MODULE, move |request: ModuleRequest, connection: Connection| {
            let context = on_module.clone();
            let modules = Arc::clone(&modules);
            async move {
                let descriptor = modules.get(&request.module).ok_or_else(|| {
                    RpcError::application(format!("module `{}` is not hosted here", request.module))
                })?;
                connection.set_submodule(Some(request.module.clone()));
                context.attach_connection(&request.module, connection);
                info!(target: "spark_hosting::coordinator", module = %request.module, "module connected");
                Ok::<_, RpcError>(ModuleReply {
                    config: descriptor.config.clone(),
                    workers: descriptor.workers.clone(),
                })
            }
        })
        .typed_one_way(
            names::MASTER,
            move |registration: Option<MasterRegistration>, connection: Connection| {
                let announcements = Arc::clone(&announcements);
                async move {
                    let Some(module) = connection.submodule() else {
                        warn!(target: "spark_hosting::coordinator", connection = connection.id(), "master announced before module");
                        return;
                    };
                    let waiting = announcements.lock().remove(&module);
                    match waiting {
                        Some(sender) => {
                            let _ = sender.send(registration);
                        }
                        None => {
                            warn!(target: "spark_hosting::coordinator", module = %module, "unexpected master announcement ignored")
                        }
                    }
                }
            },
        )
        .typed_two_way(names::GET_CONFIG, move |query: ConfigQuery, _| {
            let store = Arc::clone(&on_get);
            async move {
                store
                    .get(query.key.as_deref())
                    .await
                    .map_err(config_error_to_rpc)
            }
        })
        .typed_two_way(names::UPDATE_CONFIG, move |update: ConfigUpdate, _| {
            let store = Arc::clone(&on_update);
            async move {
                store
                    .update(update.value, update.key.as_deref())
                    .await
                    .map(|()| Value::Null)
                    .map_err(config_error_to_rpc)
            }
        })
}

/// 路由协议的主进程实现：`register` 在晚绑定转发表中登记或替换转发目标。
fn router_api(context: &HostContext) -> Result<Implementation, HostingError> {
    let meta = router_meta()?;
    let late_bound = context.late_bound().clone();
    Ok(Implementation::new().typed_one_way(
        names::REGISTER,
        move |registration: RouteRegistration, connection: Connection| {
            let proxy = meta.create_client_proxy(connection.clone());
            let late_bound = late_bound.clone();
            async move {
                let mounted = late_bound.register(
                    &registration.path,
                    ForwardToWorker::new(proxy, registration.remap.clone()),
                );
                info!(
                    target: "spark_hosting::coordinator",
                    connection = connection.id(),
                    path = %registration.path,
                    remap = %registration.remap,
                    replaced = !mounted,
                    "forwarding registered"
                );
            }
        },
    ))
}

fn config_error_to_rpc(err: ConfigError) -> RpcError {
    match err {
        ConfigError::Remote(err) => err,
        other => RpcError::application(other.to_string()).with_data(json!({ "code": other.code() })),
    }
}

/// `<module>#master` 任务体。
struct ModuleTask {
    module: String,
    master_url: Url,
    context: HostContext,
    catalog: ModuleCatalog,
    launcher: Arc<dyn WorkerLauncher>,
    announcements: Announcements,
    server: HostServer,
}

impl ModuleTask {
    async fn run(self) -> Result<(), BoxError> {
        let (sender, mut announced) = oneshot::channel();
        self.announcements.lock().insert(self.module.clone(), sender);

        let mut handle = self.launcher.launch(&self.module, &self.master_url).await?;
        let registration = tokio::select! {
            registration = &mut announced => registration
                .map_err(|_| format!("announcement channel for `{}` dropped", self.module))?,
            exit = handle.exited() => {
                self.announcements.lock().remove(&self.module);
                return Err(format!("worker for `{}` exited before announcing: {exit:?}", self.module).into());
            }
        };
        debug!(target: "spark_hosting::coordinator", module = %self.module, registration = ?registration, "master announced");
        self.context.events().emit(MasterEvent::ModuleAnnounced {
            module: self.module.clone(),
            registration: registration.clone(),
        });

        if let Some(registration) = &registration
            && let Some(path) = registration.master_path.as_deref()
        {
            match self.catalog.master(path) {
                Some(entry) => entry.start(&self.context, registration).await?,
                None => {
                    warn!(target: "spark_hosting::coordinator", module = %self.module, path, "no master entry for announced path")
                }
            }
        }

        if let Some(connection) = self.context.connection(&self.module) {
            let (worker, _) = self.server.proxy(connection);
            worker.after_master()?;
        }
        self.context.events().emit(MasterEvent::ModuleStarted {
            module: self.module.clone(),
        });
        info!(target: "spark_hosting::coordinator", module = %self.module, "module started");
        Ok(())
    }
}

/// `default` 任务体：挂载兜底与终端层，然后打开公共监听。
struct RootTask {
    context: HostContext,
    server: HostServer,
    shutdown: CancellationToken,
    public_addr: Arc<OnceLock<SocketAddr>>,
}

impl RootTask {
    async fn run(self) -> Result<(), BoxError> {
        let routers = self.context.routers();
        install_fallback(&routers.app, self.context.settings().root.clone());
        install_terminal(&routers.master);

        let address = self.context.settings().public_address();
        let local = bind_and_serve("public", &address, &routers.master, &self.shutdown).await?;
        let _ = self.public_addr.set(local);

        self.context.events().emit(MasterEvent::Ready { address: local });
        for connection in self.context.connections() {
            let (worker, _) = self.server.proxy(connection);
            if let Err(err) = worker.ready() {
                warn!(target: "spark_hosting::coordinator", code = err.code(), error = %err, "ready signal not delivered");
            }
        }
        info!(target: "spark_hosting::coordinator", address = %local, "server ready");
        Ok(())
    }
}

/// `GET *`：`.map` 直接 404，其余返回静态根目录下的 `index.html`。
fn install_fallback(app: &HttpRouter, root: Option<PathBuf>) {
    app.get(
        "*",
        handler_fn(move |req, res| {
            let root = root.clone();
            Box::pin(async move {
                if req.path().ends_with(".map") {
                    res.send_status(404);
                    return Flow::Done;
                }
                let Some(root) = root else {
                    res.send_status(404);
                    return Flow::Done;
                };
                let index = root.join("index.html");
                match tokio::fs::read(&index).await {
                    Ok(bytes) => {
                        res.set_header(http::header::CONTENT_TYPE, "text/html; charset=utf-8");
                        res.send(bytes);
                    }
                    Err(err) => {
                        debug!(target: "spark_hosting::coordinator", path = %index.display(), error = %err, "index unavailable");
                        res.send_status(404);
                    }
                }
                Flow::Done
            })
        }),
    );
}

/// 终端层：待处理错误写成 500 JSON，没有错误则 404。
fn install_terminal(master: &HttpRouter) {
    master.use_error(
        "/",
        error_handler_fn(|err, req, res| {
            Box::pin(async move {
                error!(target: "spark_hosting::coordinator", path = %req.path(), code = err.code(), error = %err, "error occurred");
                res.fail(&err.with_status(500));
                Flow::Done
            })
        }),
    );
    master.use_handler(
        "/",
        handler_fn(|_, res| {
            Box::pin(async move {
                res.send_status(404);
                Flow::Done
            })
        }),
    );
}

/// 已启动的主进程。
pub struct RunningHost {
    context: HostContext,
    graph: DependencyGraph,
    server: HostServer,
    management_addr: SocketAddr,
    master_url: Url,
    public_addr: Arc<OnceLock<SocketAddr>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for RunningHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningHost")
            .field("management_addr", &self.management_addr)
            .field("public_addr", &self.public_addr.get())
            .finish()
    }
}

impl RunningHost {
    pub fn context(&self) -> &HostContext {
        &self.context
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// 主从 RPC 端点。
    pub fn server(&self) -> &HostServer {
        &self.server
    }

    pub fn management_addr(&self) -> SocketAddr {
        self.management_addr
    }

    /// Worker 连接主进程所用的地址。
    pub fn master_url(&self) -> &Url {
        &self.master_url
    }

    /// 公共监听地址，根任务完成前为 `None`。
    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.public_addr.get().copied()
    }

    /// 等待根任务完成并返回公共监听地址。
    pub async fn ready(&self) -> Result<SocketAddr, HostingError> {
        self.graph.wait(ROOT_TASK).await?;
        self.public_addr().ok_or_else(|| {
            HostingError::Graph(GraphError::UnknownTask {
                task: ROOT_TASK.to_owned(),
            })
        })
    }

    /// 停止监听并关闭全部 Worker 连接。
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for connection in self.context.connections() {
            connection.close();
        }
    }

    /// 等待 [`shutdown`](Self::shutdown) 被调用。
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await;
    }
}
