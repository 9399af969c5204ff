use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use parking_lot::RwLock;
use thiserror::Error;

type SharedAny = Arc<dyn Any + Send + Sync + 'static>;

/// 惰性服务工厂：每次解析都会调用一次。
pub type ServiceFactory = Arc<dyn Fn(&ServiceRegistry) -> SharedAny + Send + Sync + 'static>;

/// 服务注册项，封装直接实例或惰性工厂的两种形态。
#[derive(Clone)]
pub enum ServiceEntry {
    /// 立即可用的共享实例。
    Instance(SharedAny),
    /// 解析时才创建实例的工厂。
    Factory(ServiceFactory),
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceEntry::Instance(_) => f.write_str("ServiceEntry::Instance"),
            ServiceEntry::Factory(_) => f.write_str("ServiceEntry::Factory"),
        }
    }
}

/// 注册服务时可能遇到的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceRegistrationError {
    /// 名称已被占用，禁止重复注册。
    #[error("service `{name}` already registered")]
    Duplicate { name: String },
}

impl ServiceRegistrationError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceRegistrationError::Duplicate { .. } => "hosting.service.duplicate",
        }
    }
}

/// 进程内的服务目录，按名称注册、按名称与类型解析。
///
/// # 教案级注释
/// - **目标 (Why)**
///   - 主进程与每个 Worker 各自在启动时构造一份，随上下文显式向下传递，不存在全局可变状态；
///   - 模块入口借它共享路由器、配置句柄等对象，而无需彼此直接引用。
/// - **设计要点 (How)**
///   - 内部使用 `RwLock<BTreeMap<String, ServiceEntry>>`，遍历顺序稳定；
///   - 值以 `Arc<dyn Any + Send + Sync>` 保存，解析时按调用方给定的类型向下转型。
/// - **契约 (What)**
///   - 名称区分大小写，重复注册返回 [`ServiceRegistrationError::Duplicate`]；
///   - [`resolve`](Self::resolve) 在名称缺失或类型不符时返回 `None`；
///   - 工厂在每次解析时被调用，可借参数中的注册表解析自身依赖。
/// - **风险与注意事项 (Trade-offs)**
///   - 工厂内部解析自身名称会导致无限递归，调用方需自行避免。
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    entries: Arc<RwLock<BTreeMap<String, ServiceEntry>>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ServiceRegistry {
    /// 创建空的注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册共享实例。
    pub fn register_instance<T>(&self, name: impl Into<String>, service: T) -> Result<(), ServiceRegistrationError>
    where
        T: Any + Send + Sync + 'static,
    {
        self.insert(name.into(), ServiceEntry::Instance(Arc::new(service)))
    }

    /// 注册惰性工厂。
    pub fn register_factory<T, F>(&self, name: impl Into<String>, factory: F) -> Result<(), ServiceRegistrationError>
    where
        T: Any + Send + Sync + 'static,
        F: Fn(&ServiceRegistry) -> T + Send + Sync + 'static,
    {
        let factory: ServiceFactory = Arc::new(move |registry| Arc::new(factory(registry)) as SharedAny);
        self.insert(name.into(), ServiceEntry::Factory(factory))
    }

    fn insert(&self, name: String, entry: ServiceEntry) -> Result<(), ServiceRegistrationError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(ServiceRegistrationError::Duplicate { name });
        }
        entries.insert(name, entry);
        Ok(())
    }

    /// 按名称解析并转型为 `T`。
    pub fn resolve<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync + 'static,
    {
        // 工厂可能回调注册表，调用前先释放读锁。
        let entry = self.entries.read().get(name).cloned()?;
        let value = match entry {
            ServiceEntry::Instance(value) => value,
            ServiceEntry::Factory(factory) => factory(self),
        };
        value.downcast::<T>().ok()
    }

    /// 按名称读取注册项。
    pub fn get(&self, name: &str) -> Option<ServiceEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// 全部已注册名称，按字典序。
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
