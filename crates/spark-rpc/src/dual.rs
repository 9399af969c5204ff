//! 在一条物理连接上暴露两套独立 API 的组合描述符。

use std::fmt;

use spark_router::HttpRouter;

use crate::{
    binder::{BoundServer, ClientBinder, Implementation, create_server_from_meta},
    endpoint::Endpoint,
    error::{BindError, MetaError},
    meta::{FromRemote, Meta},
};

/// 两个描述符的并集。
///
/// # 教案式说明
/// - **意图 (Why)**：主进程与 Worker 之间既要跑模块生命周期协议，又要跑路由转发协议，
///   两者各自声明，却共享同一条连接；
/// - **逻辑 (How)**：四个集合分别取并集（先 `first` 后 `second`，保持声明顺序）；
///   两侧实现按“后者覆盖前者”合并后交给一次 [`create_server_from_meta`]；
/// - **契约 (What)**：两个描述符声明了同名能力时构造失败，返回
///   [`MetaError::OverlappingCapability`]。
pub struct DualMetadata<SP1, CP1, SP2, CP2> {
    first: Meta<SP1, CP1>,
    second: Meta<SP2, CP2>,
    merged: Meta<(SP1, SP2), (CP1, CP2)>,
}

impl<SP1, CP1, SP2, CP2> fmt::Debug for DualMetadata<SP1, CP1, SP2, CP2> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualMetadata")
            .field("first", &self.first)
            .field("second", &self.second)
            .finish()
    }
}

impl<SP1, CP1, SP2, CP2> DualMetadata<SP1, CP1, SP2, CP2> {
    pub fn new(first: Meta<SP1, CP1>, second: Meta<SP2, CP2>) -> Result<Self, MetaError> {
        if let Some(name) = first.names().find(|name| second.names().any(|other| other == *name)) {
            return Err(MetaError::OverlappingCapability {
                name: name.to_owned(),
            });
        }
        let union = |a: &[String], b: &[String]| a.iter().chain(b).cloned().collect::<Vec<_>>();
        let merged = Meta::from_sets(
            union(first.server_one_way(), second.server_one_way()),
            union(first.server_two_way(), second.server_two_way()),
            union(first.client_one_way(), second.client_one_way()),
            union(first.client_two_way(), second.client_two_way()),
        );
        Ok(Self {
            first,
            second,
            merged,
        })
    }

    pub fn first(&self) -> &Meta<SP1, CP1> {
        &self.first
    }

    pub fn second(&self) -> &Meta<SP2, CP2> {
        &self.second
    }

    /// 合并后的描述符。
    pub fn meta(&self) -> &Meta<(SP1, SP2), (CP1, CP2)> {
        &self.merged
    }

    /// 客户端：合并两份实现后构造一个组合客户端。
    pub fn create_client(&self, first: Implementation, second: Implementation) -> ClientBinder<(SP1, SP2)> {
        self.merged.create_client(first.extend(second))
    }
}

impl<SP1, CP1, SP2, CP2> DualMetadata<SP1, CP1, SP2, CP2>
where
    CP1: FromRemote,
    CP2: FromRemote,
{
    /// 服务端：合并两份实现并绑定到 `router` 的 `path` 上。
    pub fn create_server(
        &self,
        router: &HttpRouter,
        path: &str,
        first: Implementation,
        second: Implementation,
    ) -> Result<BoundServer<(CP1, CP2)>, BindError> {
        create_server_from_meta(self.merged.clone()).bind(router, path, first.extend(second))
    }

    /// 与 [`create_server`](Self::create_server) 相同，但绑定到现成端点。
    pub fn create_server_on(
        &self,
        endpoint: Endpoint,
        first: Implementation,
        second: Implementation,
    ) -> Result<BoundServer<(CP1, CP2)>, BindError> {
        create_server_from_meta(self.merged.clone()).bind_endpoint(endpoint, first.extend(second))
    }
}
