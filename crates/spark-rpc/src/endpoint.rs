//! RPC 端点：能力表加上一组活动连接。

use std::{fmt, future::Future, sync::Arc};

use dashmap::DashMap;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use spark_router::{Flow, HandlerError, HttpRouter, http::handler_fn};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, MAX_FRAME_LENGTH},
    error::RpcError,
};

/// 协议升级时使用的 `Upgrade` 标签。
pub const RPC_UPGRADE_PROTOCOL: &str = "spark-rpc";

pub type OneWayFn = Arc<dyn Fn(Value, Connection) -> BoxFuture<'static, ()> + Send + Sync + 'static>;
pub type TwoWayFn =
    Arc<dyn Fn(Value, Connection) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync + 'static>;

/// 一个已暴露的能力：调用方是否期待回复。
#[derive(Clone)]
pub enum Capability {
    OneWay(OneWayFn),
    TwoWay(TwoWayFn),
}

impl Capability {
    pub fn one_way<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Capability::OneWay(Arc::new(move |params, connection| Box::pin(f(params, connection))))
    }

    pub fn two_way<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Capability::TwoWay(Arc::new(move |params, connection| Box::pin(f(params, connection))))
    }

    pub fn is_two_way(&self) -> bool {
        matches!(self, Capability::TwoWay(_))
    }

    /// 执行能力；单向能力以 `null` 作为结果。
    pub async fn invoke(&self, params: Value, connection: Connection) -> Result<Value, RpcError> {
        match self {
            Capability::OneWay(f) => {
                f(params, connection).await;
                Ok(Value::Null)
            }
            Capability::TwoWay(f) => f(params, connection).await,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::OneWay(_) => "Capability::OneWay",
            Capability::TwoWay(_) => "Capability::TwoWay",
        })
    }
}

/// 按名称索引的能力表，端点上的所有连接共享一份。
#[derive(Default)]
pub struct MethodTable {
    methods: DashMap<String, Capability>,
}

impl MethodTable {
    pub(crate) fn insert(&self, name: &str, capability: Capability) {
        if self.methods.insert(name.to_owned(), capability).is_some() {
            debug!(target: "spark_rpc", method = name, "capability replaced");
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub(crate) async fn invoke(&self, name: &str, params: Value, connection: Connection) -> Result<Value, RpcError> {
        // 先克隆出能力再等待，避免跨 await 持有分片锁。
        let capability = self
            .methods
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RpcError::method_not_found(name))?;
        capability.invoke(params, connection).await
    }
}

/// 暴露能力并接纳连接的端点。
///
/// # 契约 (What)
/// - 能力表在所有连接间共享，连接接入前后都可以追加能力；
/// - 连接关闭后自动从活动集合移除；
/// - [`notify_all`](Self::notify_all)/[`call_all`](Self::call_all) 面向当前全部活动连接；
/// - 接入的连接按端点的帧长上限解码入站帧，缺省为 [`MAX_FRAME_LENGTH`]。
#[derive(Clone, Default)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    methods: Arc<MethodTable>,
    connections: DashMap<u64, Connection>,
    max_frame_length: usize,
}

impl Default for EndpointInner {
    fn default() -> Self {
        Self {
            methods: Arc::default(),
            connections: DashMap::new(),
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("connections", &self.inner.connections.len())
            .field("max_frame_length", &self.inner.max_frame_length)
            .finish()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以自定义的入站帧长上限创建端点。
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                max_frame_length,
                ..EndpointInner::default()
            }),
        }
    }

    pub fn expose(&self, name: &str, capability: Capability) -> &Self {
        self.inner.methods.insert(name, capability);
        self
    }

    pub fn exposes(&self, name: &str) -> bool {
        self.inner.methods.contains(name)
    }

    /// 在任意双工 I/O 上建立连接。
    pub fn accept<IO>(&self, io: IO) -> Connection
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Connection::spawn(io, Arc::clone(&self.inner.methods), self.inner.max_frame_length);
        self.inner
            .connections
            .insert(connection.id(), connection.clone());

        let inner = Arc::clone(&self.inner);
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            inner.connections.remove(&watched.id());
        });
        connection
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 向全部活动连接发送通知，返回成功送出的连接数。
    pub fn notify_all(&self, method: &str, params: &Value) -> usize {
        self.connections()
            .into_iter()
            .filter(|connection| connection.notify(method, params.clone()).is_ok())
            .count()
    }

    /// 向全部活动连接发起双向调用。
    pub async fn call_all(&self, method: &str, params: &Value) -> Vec<Result<Value, RpcError>> {
        let connections = self.connections();
        join_all(
            connections
                .iter()
                .map(|connection| connection.request(method, params.clone())),
        )
        .await
    }

    /// 在 `router` 的 `path` 上挂载协议升级入口。
    ///
    /// 升级成功后底层连接移交给本端点；请求若不带升级句柄（非 hyper 来源）则以 400 失败。
    pub fn mount(&self, router: &HttpRouter, path: &str) {
        let endpoint = self.clone();
        let mount_path = path.to_owned();
        router.upgrade(
            path,
            RPC_UPGRADE_PROTOCOL,
            handler_fn(move |req, res| {
                let endpoint = endpoint.clone();
                let mount_path = mount_path.clone();
                Box::pin(async move {
                    let Some(on_upgrade) = req.take_upgrade() else {
                        return Flow::Fail(
                            HandlerError::new("rpc.upgrade.missing", "request cannot be upgraded").with_status(400),
                        );
                    };
                    res.switching_protocols(RPC_UPGRADE_PROTOCOL);
                    tokio::spawn(async move {
                        match on_upgrade.await {
                            Ok(upgraded) => {
                                let connection = endpoint.accept(hyper_util::rt::TokioIo::new(upgraded));
                                info!(target: "spark_rpc", path = %mount_path, connection = connection.id(), "rpc connection upgraded");
                            }
                            Err(err) => {
                                warn!(target: "spark_rpc", path = %mount_path, error = %err, "rpc upgrade failed");
                            }
                        }
                    });
                    Flow::Done
                })
            }),
        );
        debug!(target: "spark_rpc", path, "rpc endpoint mounted");
    }
}
