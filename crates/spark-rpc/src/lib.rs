//! # spark-rpc
//!
//! ## 角色定位（Why）
//! - 主进程与 Worker 之间的双向 RPC：双方都能主动调用对方声明的能力；
//! - 能力由 [`Meta`] 声明式描述，[`create_server_from_meta`] 与 [`Meta::create_client`]
//!   据此完成暴露、存根合成与代理构造，[`DualMetadata`] 把两套 API 合并到一条连接上。
//!
//! ## 线上格式（What）
//! - 换行分隔的 JSON 帧：请求、通知、成功回复、失败回复（见 [`Frame`]）；
//! - 失败回复携带 `{code, message, data?}`（见 [`RpcError`]）。
//!
//! ## 传输（How）
//! - 服务端：[`Endpoint::mount`] 在 [`spark_router::HttpRouter`] 上注册 `upgrade` 层，
//!   握手成功后把底层连接交给端点；
//! - 客户端：[`upgrade::connect`] 发起握手，任意 `AsyncRead + AsyncWrite` 亦可直接接入，
//!   测试中常用 `tokio::io::duplex`。

mod binder;
mod connection;
mod dual;
mod endpoint;
mod error;
mod frame;
mod meta;
pub mod upgrade;

pub use binder::{
    BoundClient, BoundServer, ClientBinder, Implementation, ServerBinder, create_server_from_meta,
};
pub use connection::{Connection, MAX_FRAME_LENGTH};
pub use dual::DualMetadata;
pub use endpoint::{Capability, Endpoint, MethodTable, OneWayFn, RPC_UPGRADE_PROTOCOL, TwoWayFn};
pub use error::{BindError, ConnectError, MetaError, RpcError};
pub use frame::Frame;
pub use meta::{CapabilityKind, FromRemote, Meta, MetaBuilder, RemoteProxy};
