//! 进程内事件总线。
//!
//! 主进程与 Worker 各持一条 `tokio::sync::broadcast` 通道；订阅方迟到时只会错过此前的事件，
//! 因此需要观察完整生命周期的一方应在启动前订阅。

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::protocol::MasterRegistration;

const CAPACITY: usize = 64;

/// 主进程生命周期事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterEvent {
    /// Worker 宣告了它的主进程依赖（可能为空）。
    ModuleAnnounced {
        module: String,
        registration: Option<MasterRegistration>,
    },
    /// 模块的 `#master` 任务完成。
    ModuleStarted { module: String },
    /// 整张依赖图完成，公共监听已打开。
    Ready { address: SocketAddr },
}

/// Worker 侧收到的生命周期信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    AfterMaster,
    Ready,
}

/// 广播总线的薄封装，发送时没有订阅者不算错误。
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + std::fmt::Debug> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + std::fmt::Debug> EventBus<E> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// 广播事件，返回收到事件的订阅者数量。
    pub fn emit(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscribers_only_see_later_events() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(WorkerEvent::AfterMaster), 0);
        let mut rx = bus.subscribe();
        assert_eq!(bus.emit(WorkerEvent::Ready), 1);
        assert_eq!(rx.recv().await.unwrap(), WorkerEvent::Ready);
    }
}
