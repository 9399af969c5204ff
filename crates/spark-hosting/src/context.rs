//! 主进程上下文。
//!
//! 取代全局服务定位器：主进程启动时构造一份 [`HostContext`]，显式传给协调器、
//! 主进程模块入口与测试代码。

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use spark_router::HttpRouter;
use spark_rpc::Connection;

use crate::{
    config::{ConfigHandle, JsonConfigStore},
    events::{EventBus, MasterEvent},
    forward::LateBoundRoutes,
    service::ServiceRegistry,
    settings::HostSettings,
};

/// 主进程的路由器组合。
///
/// # 契约 (What)
/// - `master` 依次挂载 `pre_auth`、`auth`、`late_bound`、`app`，分发顺序即挂载顺序；
/// - `late_bound` 承载 Worker 通过 `register` 申请的转发规则；
/// - `app` 在根任务中追加兜底路由，因此模块注册的路由总是先于兜底生效。
#[derive(Debug, Clone)]
pub struct MasterRouters {
    pub master: HttpRouter,
    pub pre_auth: HttpRouter,
    pub auth: HttpRouter,
    pub late_bound: HttpRouter,
    pub app: HttpRouter,
}

impl Default for MasterRouters {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterRouters {
    pub fn new() -> Self {
        let routers = Self {
            master: HttpRouter::new(),
            pre_auth: HttpRouter::new(),
            auth: HttpRouter::new(),
            late_bound: HttpRouter::new(),
            app: HttpRouter::new(),
        };
        for child in [&routers.pre_auth, &routers.auth, &routers.late_bound, &routers.app] {
            routers.master.mount("/", child.router());
        }
        routers
    }
}

struct HostInner {
    settings: HostSettings,
    store: Arc<JsonConfigStore>,
    routers: MasterRouters,
    late_bound: LateBoundRoutes,
    services: ServiceRegistry,
    events: EventBus<MasterEvent>,
    connections: DashMap<String, Connection>,
}

/// 主进程上下文，克隆共享同一份状态。
#[derive(Clone)]
pub struct HostContext {
    inner: Arc<HostInner>,
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("settings", &self.inner.settings)
            .field("services", &self.inner.services)
            .field("modules", &self.connected_modules())
            .finish()
    }
}

impl HostContext {
    pub fn new(settings: HostSettings, store: Arc<JsonConfigStore>) -> Self {
        let routers = MasterRouters::new();
        let late_bound = LateBoundRoutes::new(routers.late_bound.clone());
        Self {
            inner: Arc::new(HostInner {
                settings,
                store,
                routers,
                late_bound,
                services: ServiceRegistry::new(),
                events: EventBus::new(),
                connections: DashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<JsonConfigStore> {
        &self.inner.store
    }

    /// 以点分路径访问主进程配置。
    pub fn config(&self) -> ConfigHandle {
        ConfigHandle::new(self.inner.store.clone())
    }

    pub fn routers(&self) -> &MasterRouters {
        &self.inner.routers
    }

    /// Worker 登记的转发表，挂在 `routers().late_bound` 上。
    pub fn late_bound(&self) -> &LateBoundRoutes {
        &self.inner.late_bound
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    pub fn events(&self) -> &EventBus<MasterEvent> {
        &self.inner.events
    }

    /// 模块当前的 RPC 连接。
    pub fn connection(&self, module: &str) -> Option<Connection> {
        self.inner
            .connections
            .get(module)
            .map(|entry| entry.value().clone())
    }

    pub fn connected_modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        modules.sort();
        modules
    }

    /// 记录模块连接；同一模块的旧连接被替换并关闭。
    ///
    /// 旧连接上的转发目标在新连接重新 `register` 时被替换，见 [`LateBoundRoutes`]。
    pub(crate) fn attach_connection(&self, module: &str, connection: Connection) {
        let id = connection.id();
        if let Some(previous) = self
            .inner
            .connections
            .insert(module.to_owned(), connection)
            && previous.id() != id
        {
            previous.close();
        }
    }

    pub(crate) fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
