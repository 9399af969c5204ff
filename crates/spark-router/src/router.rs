use std::{collections::BTreeMap, fmt, sync::Arc};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    error::{HandlerError, RouteError},
    exchange::{AllowList, RoutedRequest, RoutedResponse},
    layer::{ErrorHandler, Flow, Handler, Layer, LayerKind, Predicate},
    method,
    path::PathPattern,
    route::Route,
};

/// 一次分发的最终结果。
#[derive(Debug)]
pub enum Dispatch {
    /// 某个处理器终止了链路（或 OPTIONS 自动应答已写出）。
    Handled,
    /// 没有任何层终止链路，落入死路（deadend）。
    Unhandled,
    /// 错误未被任何错误处理层消化。
    Failed(HandlerError),
}

enum Entry<Req, Res> {
    Route(Arc<Route<Req, Res>>),
    Mount(Arc<Mount<Req, Res>>),
}

impl<Req, Res> Clone for Entry<Req, Res> {
    fn clone(&self) -> Self {
        match self {
            Entry::Route(route) => Entry::Route(Arc::clone(route)),
            Entry::Mount(mount) => Entry::Mount(Arc::clone(mount)),
        }
    }
}

struct Mount<Req, Res> {
    pattern: PathPattern,
    layers: Vec<Layer<Req, Res>>,
}

struct RouterTable<Req, Res> {
    entries: Vec<Entry<Req, Res>>,
}

impl<Req, Res> Clone for RouterTable<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

/// 传输无关的路由器：按注册顺序排列的 Route 与挂载点。
///
/// # 教案级注释
/// - **意图 (Why)**
///   - HTTP 入站流量与 Worker 内部请求共用同一套“路径 + 方法 + 谓词”匹配与中间件推进逻辑；
///   - 挂载的子路由器在父路由器中表现为挂载路径上的一个复合 Route。
/// - **体系位置 (Where)**
///   - [`HttpRouter`](crate::HttpRouter) 与 [`WorkerRouter`](crate::WorkerRouter) 都是它的薄包装。
/// - **关键逻辑 (How)**
///   1. 注册表保存在 [`ArcSwap`] 中，注册通过 `rcu` 整表替换，分发只读取一次快照；
///   2. `routes` 以精确路径字符串为键，保证 [`route`](Self::route) 对同一路径返回同一 Route；
///   3. 分发按注册顺序遍历，路径命中但方法不适用的 Route 会把方法集合记入 OPTIONS 累加器后跳过。
/// - **契约说明 (What)**
///   - 分发始终按注册顺序推进，直到处理器返回 [`Flow::Done`] 或错误无人消化；
///   - 处理器执行期间不持有任何锁。
pub struct Router<Req, Res> {
    table: ArcSwap<RouterTable<Req, Res>>,
    routes: Mutex<BTreeMap<String, Arc<Route<Req, Res>>>>,
}

impl<Req, Res> Default for Router<Req, Res> {
    fn default() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouterTable {
                entries: Vec::new(),
            }),
            routes: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<Req, Res> fmt::Debug for Router<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.load();
        f.debug_struct("Router")
            .field("entries", &table.entries.len())
            .field("routes", &self.routes.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Req, Res> Router<Req, Res>
where
    Req: RoutedRequest,
    Res: RoutedResponse,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 `path` 上已有的 Route，不存在则创建并追加到注册表末尾。
    pub fn route(&self, path: &str) -> Arc<Route<Req, Res>> {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.get(path) {
            return Arc::clone(route);
        }
        let route = Arc::new(Route::new(path));
        routes.insert(path.to_owned(), Arc::clone(&route));
        self.push(Entry::Route(Arc::clone(&route)));
        route
    }

    /// 按动词名注册处理器，动词名大小写不敏感。
    pub fn on(
        &self,
        verb: &str,
        path: &str,
        handler: impl Handler<Req, Res>,
    ) -> Result<&Self, RouteError> {
        let canonical = method::verb(verb).ok_or_else(|| RouteError::UnknownVerb {
            verb: verb.to_owned(),
        })?;
        self.route(path).method(canonical, handler);
        Ok(self)
    }

    pub fn get(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).method("GET", handler);
        self
    }

    pub fn post(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).method("POST", handler);
        self
    }

    pub fn put(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).method("PUT", handler);
        self
    }

    pub fn patch(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).method("PATCH", handler);
        self
    }

    pub fn delete(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).method("DELETE", handler);
        self
    }

    pub fn head(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).method("HEAD", handler);
        self
    }

    pub fn options(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).method("OPTIONS", handler);
        self
    }

    pub fn all(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.route(path).all(handler);
        self
    }

    /// 注册协议升级层。
    ///
    /// 该层挂在伪方法 `upgrade` 上，并额外要求 `Connection` 头包含 `upgrade`、
    /// `Upgrade` 头等于 `tag`（均大小写不敏感）。
    pub fn upgrade(&self, path: &str, tag: &str, handler: impl Handler<Req, Res>) -> &Self {
        let tag = tag.to_owned();
        let predicate: Predicate<Req> = Arc::new(move |req: &Req| is_upgrade_for(req, &tag));
        self.route(path)
            .guarded(method::UPGRADE, predicate, Arc::new(handler));
        self
    }

    /// 以前缀方式挂载中间件（对应 `use`）。
    pub fn use_handler(&self, path: &str, handler: impl Handler<Req, Res>) -> &Self {
        self.push_mount(path, Layer::handler(None, Arc::new(handler)));
        self
    }

    /// 以前缀方式挂载错误处理层。
    pub fn use_error(&self, path: &str, handler: impl ErrorHandler<Req, Res>) -> &Self {
        self.push_mount(path, Layer::error(Arc::new(handler)));
        self
    }

    /// 把子路由器挂载到 `path`，子路由器看到的路径为挂载点之后的剩余部分。
    pub fn mount(&self, path: &str, router: Arc<Router<Req, Res>>) -> &Self {
        self.push_mount(path, Layer::handler(None, router));
        self
    }

    fn push_mount(&self, path: &str, layer: Layer<Req, Res>) {
        self.push(Entry::Mount(Arc::new(Mount {
            pattern: PathPattern::parse(path),
            layers: vec![layer],
        })));
    }

    fn push(&self, entry: Entry<Req, Res>) {
        self.table.rcu(|current| {
            let mut next = RouterTable::clone(current);
            next.entries.push(entry.clone());
            next
        });
    }

    /// 分发入口。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：
    ///   1. OPTIONS 请求启用方法累加器；
    ///   2. 遍历注册表，命中 Route 时检查方法适用性，不适用则记录方法后跳过，避免触发无关副作用；
    ///   3. 普通层与错误层依据链路上是否存在待处理错误交替生效；
    ///   4. 无人终止时若累加器非空则写出 OPTIONS 应答，否则返回 [`Dispatch::Unhandled`]。
    /// - **契约 (What)**：返回值只描述本路由器的结果，死路与错误的最终呈现由传输层决定。
    pub async fn dispatch(&self, req: &mut Req, res: &mut Res) -> Dispatch {
        let mut allow = method::is(req.method(), method::OPTIONS).then(AllowList::new);
        match self.walk(req, res, allow.as_mut()).await {
            Flow::Done => Dispatch::Handled,
            Flow::Fail(error) => Dispatch::Failed(error),
            Flow::Next => match allow {
                Some(allow) if !allow.is_empty() => match res.send_allow(&allow) {
                    Ok(()) => Dispatch::Handled,
                    Err(error) => Dispatch::Failed(error),
                },
                _ => Dispatch::Unhandled,
            },
        }
    }

    async fn walk(&self, req: &mut Req, res: &mut Res, mut allow: Option<&mut AllowList>) -> Flow {
        let table = self.table.load_full();
        let mut pending: Option<HandlerError> = None;

        for entry in &table.entries {
            match entry {
                Entry::Route(route) => {
                    let Some(params) = route.pattern().matches(req.path()) else {
                        continue;
                    };
                    let state = route.snapshot();
                    let effective = state.effective_method(req.method()).to_owned();
                    if !state.handles(&effective, req) {
                        if let Some(allow) = allow.as_deref_mut() {
                            allow.extend(state.methods.iter());
                        }
                        trace!(path = route.path(), method = %effective, "route skipped: no applicable layer");
                        continue;
                    }

                    *req.params_mut() = params;
                    for layer in &state.layers {
                        if !layer.applies(&effective, req) {
                            continue;
                        }
                        if let Some(flow) = run_layer(layer, &mut pending, req, res).await {
                            return flow;
                        }
                    }
                }
                Entry::Mount(mount) => {
                    let Some(matched) = mount.pattern.match_prefix(req.path()) else {
                        continue;
                    };
                    let original = req.path().to_owned();
                    req.params_mut().extend(matched.params);
                    req.set_path(matched.remainder);
                    let mut finished = None;
                    for layer in &mount.layers {
                        if let Some(flow) = run_layer(layer, &mut pending, req, res).await {
                            finished = Some(flow);
                            break;
                        }
                    }
                    req.set_path(original);
                    if let Some(flow) = finished {
                        return flow;
                    }
                }
            }
        }

        match pending {
            Some(error) => Flow::Fail(error),
            None => Flow::Next,
        }
    }
}

/// 执行单个层；返回 `Some(Flow::Done)` 表示链路终止。
async fn run_layer<Req, Res>(
    layer: &Layer<Req, Res>,
    pending: &mut Option<HandlerError>,
    req: &mut Req,
    res: &mut Res,
) -> Option<Flow>
where
    Req: RoutedRequest,
    Res: RoutedResponse,
{
    let flow = match (&layer.kind, pending.take()) {
        (LayerKind::Handler(handler), None) => handler.handle(req, res).await,
        (LayerKind::Error(handler), Some(error)) => handler.handle_error(error, req, res).await,
        // 错误在途时普通层跳过，无错误时错误层跳过。
        (LayerKind::Handler(_), Some(error)) => Flow::Fail(error),
        (LayerKind::Error(_), None) => Flow::Next,
    };
    match flow {
        Flow::Done => Some(Flow::Done),
        Flow::Next => None,
        Flow::Fail(error) => {
            *pending = Some(error);
            None
        }
    }
}

fn is_upgrade_for<Req: RoutedRequest>(req: &Req, tag: &str) -> bool {
    if !method::is(req.method(), method::UPGRADE) {
        return false;
    }
    let connection_upgrade = req.header("connection").is_some_and(|value| {
        value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    let protocol_matches = req
        .header("upgrade")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(tag));
    connection_upgrade && protocol_matches
}

#[async_trait]
impl<Req, Res> Handler<Req, Res> for Router<Req, Res>
where
    Req: RoutedRequest,
    Res: RoutedResponse,
{
    async fn handle(&self, req: &mut Req, res: &mut Res) -> Flow {
        match self.dispatch(req, res).await {
            Dispatch::Handled => Flow::Done,
            Dispatch::Unhandled => Flow::Next,
            Dispatch::Failed(error) => Flow::Fail(error),
        }
    }
}
