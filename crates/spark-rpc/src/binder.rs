//! 把 [`Meta`] 描述符与本地实现绑定成活动端点。
//!
//! # 教案级注释
//! - **意图 (Why)**：调用方只声明能力并提供本地实现，暴露入站能力、合成出站存根、
//!   构造远程代理这些机械工作全部由绑定器完成。
//! - **关键逻辑 (How)**：
//!   1. 服务端能力逐一从 [`Implementation`] 取出并暴露到 [`Endpoint`]，缺失即 [`BindError`]；
//!   2. 客户端能力中本地未实现的名称合成为存根，存根经端点向全部活动连接发出调用；
//!   3. 客户端绑定只暴露本地实现了的客户端能力，服务端能力由类型化代理调用。
//! - **契约 (What)**：远端失败总是以 [`RpcError`] 值交还，从不在本地 panic。

use std::{collections::BTreeMap, fmt, future::Future, marker::PhantomData, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use spark_router::HttpRouter;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    connection::Connection,
    endpoint::{Capability, Endpoint},
    error::{BindError, ConnectError, RpcError},
    meta::{FromRemote, Meta, RemoteProxy},
    upgrade,
};

/// 按能力名称组织的本地实现。
#[derive(Clone, Default)]
pub struct Implementation {
    handlers: BTreeMap<String, Capability>,
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementation")
            .field("names", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Implementation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one_way<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Value, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(name.to_owned(), Capability::one_way(f));
        self
    }

    pub fn two_way<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Value, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.handlers.insert(name.to_owned(), Capability::two_way(f));
        self
    }

    /// 参数与结果经 serde 转换的双向能力，参数不合法时以 `invalid params` 回复。
    pub fn typed_two_way<P, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.two_way(name, move |params, connection| {
            let f = Arc::clone(&f);
            async move {
                let params: P = serde_json::from_value(params)
                    .map_err(|err| RpcError::invalid_params(err.to_string()))?;
                let reply = f(params, connection).await?;
                serde_json::to_value(reply).map_err(|err| RpcError::internal(err.to_string()))
            }
        })
    }

    /// 参数经 serde 转换的单向能力，参数不合法时记录告警并丢弃。
    pub fn typed_one_way<P, F, Fut>(self, name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        let method = name.to_owned();
        self.one_way(name, move |params, connection| {
            let f = Arc::clone(&f);
            let method = method.clone();
            async move {
                match serde_json::from_value::<P>(params) {
                    Ok(params) => f(params, connection).await,
                    Err(err) => {
                        warn!(target: "spark_rpc", method = %method, error = %err, "notification params rejected")
                    }
                }
            }
        })
    }

    /// 合并另一份实现，同名时以 `other` 为准。
    pub fn extend(mut self, other: Implementation) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// 以描述符构造服务端绑定器。
pub fn create_server_from_meta<SP, CP>(meta: Meta<SP, CP>) -> ServerBinder<SP, CP> {
    ServerBinder { meta }
}

/// 服务端绑定器：`(router, path, implementation) -> BoundServer`。
pub struct ServerBinder<SP, CP> {
    meta: Meta<SP, CP>,
}

impl<SP, CP> ServerBinder<SP, CP>
where
    CP: FromRemote,
{
    /// 在 `router` 的 `path` 上挂载新端点并绑定实现。
    pub fn bind(
        &self,
        router: &HttpRouter,
        path: &str,
        implementation: Implementation,
    ) -> Result<BoundServer<CP>, BindError> {
        let endpoint = Endpoint::new();
        let bound = self.bind_endpoint(endpoint.clone(), implementation)?;
        endpoint.mount(router, path);
        Ok(bound)
    }

    /// 把实现绑定到一个现成的端点（不做挂载），供非 HTTP 传输使用。
    pub fn bind_endpoint(
        &self,
        endpoint: Endpoint,
        implementation: Implementation,
    ) -> Result<BoundServer<CP>, BindError> {
        for name in self
            .meta
            .server_one_way()
            .iter()
            .chain(self.meta.server_two_way())
        {
            let capability = implementation
                .get(name)
                .ok_or_else(|| BindError::MissingImplementation { name: name.clone() })?;
            endpoint.expose(name, capability.clone());
        }

        let stubs: Vec<String> = self
            .meta
            .client_one_way()
            .iter()
            .chain(self.meta.client_two_way())
            .filter(|name| !implementation.contains(name))
            .cloned()
            .collect();
        debug!(target: "spark_rpc", stubs = ?stubs, "server bound");

        Ok(BoundServer {
            endpoint,
            implementation,
            meta: self.meta.clone().with_proxies(),
            stubs,
            _proxy: PhantomData,
        })
    }
}

/// 绑定完成的服务端。
///
/// 客户端能力中本地未实现的名称可通过 [`notify`](Self::notify)、[`call`](Self::call)
/// 与 [`call_with`](Self::call_with) 调用，调用面向端点上的全部活动连接。
pub struct BoundServer<CP> {
    endpoint: Endpoint,
    implementation: Implementation,
    meta: Meta<RemoteProxy, CP>,
    stubs: Vec<String>,
    _proxy: PhantomData<fn() -> CP>,
}

impl<CP> Clone for BoundServer<CP> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            implementation: self.implementation.clone(),
            meta: self.meta.clone(),
            stubs: self.stubs.clone(),
            _proxy: PhantomData,
        }
    }
}

impl<CP> fmt::Debug for BoundServer<CP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundServer")
            .field("endpoint", &self.endpoint)
            .field("stubs", &self.stubs)
            .finish()
    }
}

impl<CP: FromRemote> BoundServer<CP> {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn implementation(&self) -> &Implementation {
        &self.implementation
    }

    pub fn has_stub(&self, name: &str) -> bool {
        self.stubs.iter().any(|stub| stub == name)
    }

    fn stub(&self, name: &str) -> Result<(), BindError> {
        if self.has_stub(name) {
            Ok(())
        } else {
            Err(BindError::NoStub { name: name.to_owned() })
        }
    }

    /// 经存根向全部连接发送通知，返回送达的连接数。
    pub fn notify(&self, name: &str, params: Value) -> Result<usize, BindError> {
        self.stub(name)?;
        Ok(self.endpoint.notify_all(name, &params))
    }

    /// 经存根向全部连接发起双向调用。
    pub async fn call(&self, name: &str, params: Value) -> Result<Vec<Result<Value, RpcError>>, BindError> {
        self.stub(name)?;
        Ok(self.endpoint.call_all(name, &params).await)
    }

    /// 与 [`call`](Self::call) 相同，但额外在回复到达时调用 `callback`；返回的句柄可等待完成。
    pub fn call_with<F>(&self, name: &str, params: Value, callback: F) -> Result<JoinHandle<()>, BindError>
    where
        F: FnOnce(Vec<Result<Value, RpcError>>) + Send + 'static,
    {
        self.stub(name)?;
        let endpoint = self.endpoint.clone();
        let name = name.to_owned();
        Ok(tokio::spawn(async move {
            callback(endpoint.call_all(&name, &params).await);
        }))
    }

    /// 针对单个连接的类型化客户端代理。
    pub fn proxy(&self, connection: Connection) -> CP {
        self.meta.create_client_proxy(connection)
    }
}

impl<SP, CP> Meta<SP, CP> {
    /// 以本地客户端实现构造客户端绑定器。
    pub fn create_client(&self, implementation: Implementation) -> ClientBinder<SP> {
        ClientBinder {
            meta: self.clone().with_proxies(),
            implementation,
        }
    }
}

/// 客户端绑定器。
pub struct ClientBinder<SP> {
    meta: Meta<SP, RemoteProxy>,
    implementation: Implementation,
}

impl<SP: FromRemote> ClientBinder<SP> {
    /// 在现成的双工 I/O 上建立客户端。
    pub fn connect_io<IO>(&self, io: IO) -> BoundClient<SP>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let endpoint = Endpoint::new();
        for name in self
            .meta
            .client_one_way()
            .iter()
            .chain(self.meta.client_two_way())
        {
            match self.implementation.get(name) {
                Some(capability) => {
                    endpoint.expose(name, capability.clone());
                }
                None => debug!(target: "spark_rpc", method = %name, "client capability left unimplemented"),
            }
        }
        let connection = endpoint.accept(io);
        let proxy = self.meta.create_server_proxy(connection.clone());
        BoundClient {
            endpoint,
            connection,
            proxy,
        }
    }

    /// 以 HTTP 协议升级连接到 `url` 指向的端点。
    pub async fn connect(&self, url: &Url) -> Result<BoundClient<SP>, ConnectError> {
        let io = upgrade::connect(url).await?;
        Ok(self.connect_io(io))
    }
}

/// 已连接的客户端。
pub struct BoundClient<SP> {
    endpoint: Endpoint,
    connection: Connection,
    proxy: SP,
}

impl<SP> fmt::Debug for BoundClient<SP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundClient")
            .field("connection", &self.connection)
            .finish()
    }
}

impl<SP> BoundClient<SP> {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn proxy(&self) -> &SP {
        &self.proxy
    }
}
