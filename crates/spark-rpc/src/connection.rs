//! 双向 RPC 连接。
//!
//! # 教案级注释
//! - **意图 (Why)**：主进程与每个 Worker 之间只有一条双工通道，双方都可以主动发起调用，
//!   因此连接本身不区分“客户端/服务端”，只区分入站帧与出站帧。
//! - **关键逻辑 (How)**：
//!   1. I/O 拆成读写两半，各由一个任务驱动，帧以换行分隔（`LinesCodec`）；
//!   2. 出站帧经无界通道交给写任务，调用方无需持有写锁；
//!   3. 双向调用以自增 ID 关联，等待者保存在 `DashMap` 中，连接关闭时统一以
//!      `connection closed` 失败；
//!   4. 入站请求在独立任务中执行，慢处理器不会阻塞读循环。
//! - **契约 (What)**：克隆共享同一条连接；`submodule` 标签用于区分复用同一连接的多个逻辑模块。
//!   单帧长度受 [`MAX_FRAME_LENGTH`] 约束，超长帧使连接以 `rpc.frame.too_large` 关闭。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use crate::{endpoint::MethodTable, error::RpcError, frame::Frame};

/// 单帧（不含换行）允许的最大字节数。
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Pending = DashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

/// 一条双工 RPC 连接的共享句柄。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Pending,
    next_request: AtomicU64,
    submodule: RwLock<Option<String>>,
    closed: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("submodule", &*self.inner.submodule.read())
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl Connection {
    /// 在 `io` 上启动读写任务，入站调用交给 `methods` 处理。
    pub(crate) fn spawn<IO>(io: IO, methods: Arc<MethodTable>, max_frame_length: usize) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, mut rx) = mpsc::unbounded_channel::<Frame>();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                outbound,
                pending: DashMap::new(),
                next_request: AtomicU64::new(1),
                submodule: RwLock::new(None),
                closed: CancellationToken::new(),
            }),
        };

        let (read, write) = tokio::io::split(io);

        let closed = connection.inner.closed.clone();
        let id = connection.id();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write, LinesCodec::new());
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let line = match frame.encode() {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(target: "spark_rpc", connection = id, error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(line).await {
                    debug!(target: "spark_rpc", connection = id, error = %err, "write half closed");
                    break;
                }
            }
            if let Err(err) = SinkExt::<String>::close(&mut sink).await {
                debug!(target: "spark_rpc", connection = id, error = %err, "write half did not close cleanly");
            }
            closed.cancel();
        });

        let reader = connection.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(max_frame_length));
            let mut failure = RpcError::connection_closed();
            loop {
                let line = tokio::select! {
                    _ = reader.inner.closed.cancelled() => break,
                    line = lines.next() => line,
                };
                match line {
                    Some(Ok(line)) if line.trim().is_empty() => {}
                    Some(Ok(line)) => reader.receive(&line, &methods),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(target: "spark_rpc", connection = reader.id(), limit = max_frame_length, "inbound frame exceeds the length limit");
                        failure = RpcError::frame_too_large(max_frame_length);
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(target: "spark_rpc", connection = reader.id(), error = %err, "read half failed");
                        break;
                    }
                    None => break,
                }
            }
            reader.shutdown_with(failure);
        });

        debug!(target: "spark_rpc", connection = connection.id(), "connection opened");
        connection
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn submodule(&self) -> Option<String> {
        self.inner.submodule.read().clone()
    }

    pub fn set_submodule(&self, submodule: Option<String>) {
        *self.inner.submodule.write() = submodule;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// 等待连接关闭。
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// 主动关闭连接，未完成的调用以 `connection closed` 失败。
    pub fn close(&self) {
        self.shutdown();
    }

    /// 发送单向通知。
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        trace!(target: "spark_rpc", connection = self.id(), method, "notify");
        self.send(Frame::Notification {
            method: method.to_owned(),
            params,
        })
    }

    /// 发起双向调用并等待回复。
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::connection_closed());
        }
        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        if self.is_closed() {
            self.inner.pending.remove(&id);
            return Err(RpcError::connection_closed());
        }
        trace!(target: "spark_rpc", connection = self.id(), id, method, "request");
        let sent = self.send(Frame::Request {
            id,
            method: method.to_owned(),
            params,
        });
        if let Err(err) = sent {
            self.inner.pending.remove(&id);
            return Err(err);
        }
        rx.await.unwrap_or_else(|_| Err(RpcError::connection_closed()))
    }

    fn send(&self, frame: Frame) -> Result<(), RpcError> {
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| RpcError::connection_closed())
    }

    fn receive(&self, line: &str, methods: &Arc<MethodTable>) {
        let frame = match Frame::decode(line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "spark_rpc", connection = self.id(), error = %err, "malformed frame ignored");
                return;
            }
        };
        match frame {
            Frame::Request { id, method, params } => {
                let methods = Arc::clone(methods);
                let connection = self.clone();
                tokio::spawn(async move {
                    let outcome = methods.invoke(&method, params, connection.clone()).await;
                    if let Err(err) = &outcome {
                        debug!(target: "spark_rpc", connection = connection.id(), method, code = err.code(), "request failed");
                    }
                    if connection.send(Frame::reply(id, outcome)).is_err() {
                        debug!(target: "spark_rpc", connection = connection.id(), id, "reply dropped, connection closed");
                    }
                });
            }
            Frame::Notification { method, params } => {
                let methods = Arc::clone(methods);
                let connection = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = methods.invoke(&method, params, connection.clone()).await {
                        warn!(target: "spark_rpc", connection = connection.id(), method, error = %err, "notification handler failed");
                    }
                });
            }
            Frame::Success { id, result } => self.resolve(id, Ok(result)),
            Frame::Failure { id, error } => self.resolve(id, Err(error)),
        }
    }

    fn resolve(&self, id: u64, outcome: Result<Value, RpcError>) {
        match self.inner.pending.remove(&id) {
            Some((_, waiter)) => {
                let _ = waiter.send(outcome);
            }
            None => warn!(target: "spark_rpc", connection = self.id(), id, "reply for unknown request"),
        }
    }

    fn shutdown(&self) {
        self.shutdown_with(RpcError::connection_closed());
    }

    /// 关闭连接，并以 `reason` 结束所有未完成的调用。
    fn shutdown_with(&self, reason: RpcError) {
        if !self.inner.closed.is_cancelled() {
            debug!(target: "spark_rpc", connection = self.id(), code = reason.code(), "connection closed");
        }
        self.inner.closed.cancel();
        let ids: Vec<u64> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.inner.pending.remove(&id) {
                let _ = waiter.send(Err(reason.clone()));
            }
        }
    }
}
