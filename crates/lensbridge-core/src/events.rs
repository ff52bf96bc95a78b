//! 事件流
//!
//! 引擎通过 [`EventSink`] 向 UI 汇报进度。发送是非阻塞的，
//! 通道满了就丢弃，绝不因为 UI 处理慢而拖住协议。

use crate::link::{ConnectionState, Side};
use crate::logging::{LogEntry, LogLevel};
use crate::protocol::Notification;
use tokio::sync::mpsc;

/// 默认事件通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum GlassesEvent {
    /// 人类可读的状态消息
    Status(LogEntry),
    Paired {
        side: Side,
        name: String,
        address: String,
    },
    ConnectionChanged {
        side: Side,
        state: ConnectionState,
    },
    /// 第 `index` 帧（从 0 开始）已写出
    FrameSent {
        side: Side,
        index: usize,
        total: usize,
    },
    HeartbeatSent {
        side: Side,
        seq: u8,
    },
    Reconnecting {
        side: Side,
        attempt: u32,
        max: u32,
    },
    Reconnected {
        side: Side,
        attempt: u32,
    },
    ReconnectExhausted {
        side: Side,
        attempts: u32,
    },
    Notification {
        side: Side,
        notification: Notification,
    },
    Released {
        side: Side,
    },
}

/// 事件发送端
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<GlassesEvent>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<GlassesEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// 丢弃所有事件
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: GlassesEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }

    /// 发送状态消息，同时写入日志
    pub fn status(&self, level: LogLevel, side: Option<Side>, message: impl Into<String>) {
        let entry = LogEntry::new(level, side, message);
        log::log!(level.as_log_level(), "{}", entry.message);
        self.emit(GlassesEvent::Status(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_is_delivered() {
        let (sink, mut rx) = EventSink::channel(4);
        sink.status(LogLevel::Info, Some(Side::Left), "hello");
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            GlassesEvent::Status(LogEntry::new(LogLevel::Info, Some(Side::Left), "hello"))
        );
    }

    #[test]
    fn test_full_channel_drops() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(GlassesEvent::Released { side: Side::Left });
        sink.emit(GlassesEvent::Released { side: Side::Right });
        assert_eq!(
            rx.try_recv().unwrap(),
            GlassesEvent::Released { side: Side::Left }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_sink() {
        EventSink::disabled().emit(GlassesEvent::Released { side: Side::Left });
    }
}
