//! # graph 模块说明
//!
//! ## 角色定位（Why）
//! - 模块启动顺序由依赖图决定：每个模块一个 `<module>#master` 任务，根任务 `default`
//!   依赖全部模块任务，根任务完成前公共监听不会打开；
//! - 独立分支并发推进，只有图中的边会串行化。
//!
//! ## 契约（What）
//! - [`DependencyGraph::start`] 只推进尚未启动的任务，对已启动或已完成的任务是空操作；
//! - 依赖缺失：发出一次 `task_not_found`，该任务永不执行，其下游同样永不执行；
//! - 任务失败（含 panic）：发出 `task_err`，仅中止该分支，不影响进程；
//! - 不提供超时与取消，卡住的任务会让其下游无限等待。
//!
//! ## 实现策略（How）
//! - 每个任务持有一个 `watch` 通道广播自身状态，下游任务的执行体在独立的 tokio 任务中
//!   依次等待上游进入终态；
//! - 执行体以 `FnOnce` 保存，启动时取走，保证每个任务最多执行一次。

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{BoxError, GraphError};

type TaskBody = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static>;
type Listener = Arc<dyn Fn(&GraphEvent) + Send + Sync + 'static>;

/// 依赖图向监听者与日志广播的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    TaskStart { task: String },
    TaskStop { task: String },
    TaskNotFound { task: String, missing: String },
    TaskErr { task: String, message: String },
}

impl GraphEvent {
    /// 事件名，与日志中的 `event` 字段一致。
    pub fn src(&self) -> &'static str {
        match self {
            GraphEvent::TaskStart { .. } => "task_start",
            GraphEvent::TaskStop { .. } => "task_stop",
            GraphEvent::TaskNotFound { .. } => "task_not_found",
            GraphEvent::TaskErr { .. } => "task_err",
        }
    }

    pub fn task(&self) -> &str {
        match self {
            GraphEvent::TaskStart { task }
            | GraphEvent::TaskStop { task }
            | GraphEvent::TaskNotFound { task, .. }
            | GraphEvent::TaskErr { task, .. } => task,
        }
    }
}

/// 任务状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed(String),
    /// 因依赖缺失或上游失败而永不执行。
    Abandoned(GraphError),
}

impl TaskStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed(_) | TaskStatus::Abandoned(_)
        )
    }
}

struct TaskEntry {
    deps: Vec<String>,
    body: Option<TaskBody>,
    status: watch::Sender<TaskStatus>,
}

enum Upstream {
    Registered(String, watch::Receiver<TaskStatus>),
    Missing(String),
}

#[derive(Default)]
struct GraphInner {
    tasks: Mutex<BTreeMap<String, TaskEntry>>,
    listeners: RwLock<Vec<Listener>>,
}

/// 模块启动依赖图。
///
/// 克隆共享同一张图，执行体在 tokio 运行时上并发推进。
#[derive(Clone, Default)]
pub struct DependencyGraph {
    inner: Arc<GraphInner>,
}

impl fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = self.inner.tasks.lock();
        f.debug_map()
            .entries(tasks.iter().map(|(name, entry)| (name, &entry.deps)))
            .finish()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任务；名称重复时返回 [`GraphError::DuplicateTask`]。
    pub fn add<F, Fut>(
        &self,
        name: impl Into<String>,
        deps: impl IntoIterator<Item = impl Into<String>>,
        body: F,
    ) -> Result<(), GraphError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.inner.tasks.lock();
        if tasks.contains_key(&name) {
            return Err(GraphError::DuplicateTask { task: name });
        }
        let (status, _) = watch::channel(TaskStatus::Pending);
        let body: TaskBody = Box::new(move || body().boxed());
        tasks.insert(
            name,
            TaskEntry {
                deps: deps.into_iter().map(Into::into).collect(),
                body: Some(body),
                status,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.tasks.lock().contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<TaskStatus> {
        self.inner
            .tasks
            .lock()
            .get(name)
            .map(|entry| entry.status.borrow().clone())
    }

    /// 订阅全部图事件。
    pub fn on_all(&self, listener: impl Fn(&GraphEvent) + Send + Sync + 'static) {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// 启动 `name` 及其传递依赖中尚未启动的任务。
    ///
    /// 返回时任务仅被调度，完成情况通过 [`wait`](Self::wait) 或事件观察。
    pub fn start(&self, name: &str) -> Result<(), GraphError> {
        let launches = {
            let mut tasks = self.inner.tasks.lock();
            if !tasks.contains_key(name) {
                return Err(GraphError::UnknownTask {
                    task: name.to_owned(),
                });
            }
            let mut order = Vec::new();
            collect(&tasks, name, &mut BTreeSet::new(), &mut BTreeSet::new(), &mut order)?;

            let mut launches = Vec::new();
            for task in order {
                let Some(entry) = tasks.get_mut(&task) else {
                    continue;
                };
                let Some(body) = entry.body.take() else {
                    continue;
                };
                let status = entry.status.clone();
                let deps = entry.deps.clone();
                let upstream = deps
                    .into_iter()
                    .map(|dep| match tasks.get(&dep) {
                        Some(dep_entry) => Upstream::Registered(dep, dep_entry.status.subscribe()),
                        None => Upstream::Missing(dep),
                    })
                    .collect::<Vec<_>>();
                launches.push((task, upstream, body, status));
            }
            launches
        };

        for (task, upstream, body, status) in launches {
            let graph = self.clone();
            tokio::spawn(async move { graph.run(task, upstream, body, status).await });
        }
        Ok(())
    }

    /// 等待任务进入终态。
    pub async fn wait(&self, name: &str) -> Result<(), GraphError> {
        let mut rx = self
            .inner
            .tasks
            .lock()
            .get(name)
            .map(|entry| entry.status.subscribe())
            .ok_or_else(|| GraphError::UnknownTask {
                task: name.to_owned(),
            })?;
        let status = rx
            .wait_for(TaskStatus::is_terminal)
            .await
            .map(|status| status.clone())
            .map_err(|_| GraphError::UnknownTask {
                task: name.to_owned(),
            })?;
        match status {
            TaskStatus::Done => Ok(()),
            TaskStatus::Failed(message) => Err(GraphError::TaskFailed {
                task: name.to_owned(),
                message,
            }),
            TaskStatus::Abandoned(cause) => Err(cause),
            TaskStatus::Pending | TaskStatus::Running => Err(GraphError::UnknownTask {
                task: name.to_owned(),
            }),
        }
    }

    async fn run(
        self,
        task: String,
        upstream: Vec<Upstream>,
        body: TaskBody,
        status: watch::Sender<TaskStatus>,
    ) {
        for dep in upstream {
            let blocked = match dep {
                Upstream::Missing(missing) => {
                    let cause = GraphError::TaskNotFound {
                        task: task.clone(),
                        missing: missing.clone(),
                    };
                    self.emit(GraphEvent::TaskNotFound {
                        task: task.clone(),
                        missing,
                    });
                    Some(cause)
                }
                Upstream::Registered(name, mut rx) => {
                    match rx.wait_for(TaskStatus::is_terminal).await.map(|s| s.clone()) {
                        Ok(TaskStatus::Done) => None,
                        Ok(TaskStatus::Failed(message)) => Some(GraphError::TaskFailed { task: name, message }),
                        Ok(TaskStatus::Abandoned(cause)) => Some(cause),
                        Ok(_) | Err(_) => Some(GraphError::UnknownTask { task: name }),
                    }
                }
            };
            if let Some(cause) = blocked {
                debug!(target: "spark_hosting::graph", task = %task, cause = %cause, "task abandoned");
                status.send_replace(TaskStatus::Abandoned(cause));
                return;
            }
        }

        status.send_replace(TaskStatus::Running);
        self.emit(GraphEvent::TaskStart { task: task.clone() });
        let outcome = AssertUnwindSafe(async move { body().await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                self.emit(GraphEvent::TaskStop { task: task.clone() });
                status.send_replace(TaskStatus::Done);
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                self.emit(GraphEvent::TaskErr {
                    task: task.clone(),
                    message: message.clone(),
                });
                status.send_replace(TaskStatus::Failed(message));
            }
            Err(_) => {
                let message = "task panicked".to_owned();
                self.emit(GraphEvent::TaskErr {
                    task: task.clone(),
                    message: message.clone(),
                });
                status.send_replace(TaskStatus::Failed(message));
            }
        }
    }

    fn emit(&self, event: GraphEvent) {
        match &event {
            GraphEvent::TaskStart { task } => {
                debug!(target: "spark_hosting::graph", event = event.src(), task = %task)
            }
            GraphEvent::TaskStop { task } => {
                info!(target: "spark_hosting::graph", event = event.src(), task = %task, "task completed")
            }
            GraphEvent::TaskNotFound { task, missing } => {
                error!(target: "spark_hosting::graph", event = event.src(), task = %task, missing = %missing, "dependency was never registered")
            }
            GraphEvent::TaskErr { task, message } => {
                error!(target: "spark_hosting::graph", event = event.src(), task = %task, error = %message, "task failed")
            }
        }
        let listeners = self.inner.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// 后序收集 `name` 的依赖闭包，缺失的依赖留给执行阶段报告。
fn collect(
    tasks: &BTreeMap<String, TaskEntry>,
    name: &str,
    visiting: &mut BTreeSet<String>,
    visited: &mut BTreeSet<String>,
    order: &mut Vec<String>,
) -> Result<(), GraphError> {
    if visited.contains(name) {
        return Ok(());
    }
    let Some(entry) = tasks.get(name) else {
        return Ok(());
    };
    if !visiting.insert(name.to_owned()) {
        return Err(GraphError::Cycle {
            task: name.to_owned(),
        });
    }
    for dep in &entry.deps {
        collect(tasks, dep, visiting, visited, order)?;
    }
    visiting.remove(name);
    visited.insert(name.to_owned());
    order.push(name.to_owned());
    Ok(())
}
