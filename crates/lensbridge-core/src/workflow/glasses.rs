//! 眼镜工作流
//!
//! 面向 UI 的高层 API：配对、发送文本、发送位图、全部断开。
//!
//! 1. 文本/位图先经过分包器（超限在任何 I/O 之前失败）
//! 2. 取出对应侧的会话，必要时重连
//! 3. 在会话锁内按固定间隔依次写出所有帧
//!
//! 左右两侧的发送互不阻塞，`*_all` 方法会并发地发往两侧。

use crate::config::{AppSettings, ConfigError};
use crate::events::EventSink;
use crate::link::{ConnectionState, LinkSession, SessionError, Side, Transport};
use crate::logging::LogLevel;
use crate::pairing::{PairingCoordinator, PairingError};
use crate::protocol::{BitmapFramer, FramingError, TextFramer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

/// 已配对会话的快照，下标 0 为左侧
type Sessions<T> = [Option<Arc<LinkSession<T>>>; 2];

#[derive(Debug, thiserror::Error)]
pub enum GlassesError {
    #[error("Nothing to send")]
    EmptyPayload,

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("{0} lens is not paired")]
    NotPaired(Side),

    #[error("{0} lens is unavailable after exhausting reconnect attempts, pair it again")]
    ReconnectExhausted(Side),

    #[error("Cannot pair {requested} lens now (next: {})", .next.map_or("none", |s| s.name()))]
    OutOfOrder {
        requested: Side,
        next: Option<Side>,
    },

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GlassesError {
    /// 多帧发送中途失败时，已成功写出的帧数
    pub fn frames_sent(&self) -> Option<usize> {
        match self {
            GlassesError::Session(SessionError::TransportWriteFailed { sent, .. }) => Some(*sent),
            _ => None,
        }
    }
}

pub struct Glasses<T: Transport> {
    pairing: Mutex<PairingCoordinator<T>>,
    /// 发送路径只读这个快照，不等待进行中的配对
    sessions: watch::Sender<Sessions<T>>,
    text: TextFramer,
    bitmap: BitmapFramer,
    pacing: Duration,
    events: EventSink,
}

impl<T: Transport> Glasses<T> {
    pub fn new(
        transport: Arc<T>,
        settings: &AppSettings,
        events: EventSink,
    ) -> Result<Self, GlassesError> {
        settings.validate()?;
        let pairing = PairingCoordinator::new(
            transport,
            settings.discovery_filter(),
            settings.liveness_config(),
            events.clone(),
        );

        let (sessions, _) = watch::channel([None, None]);

        Ok(Self {
            pairing: Mutex::new(pairing),
            sessions,
            text: TextFramer::new(settings.protocol.text_body_size)?,
            bitmap: BitmapFramer::new(settings.protocol.bitmap_body_size)?,
            pacing: settings.protocol.frame_delay(),
            events,
        })
    }

    /// 配对指定一侧
    ///
    /// 左右是按顺序分配的，所以只能配对协调器的下一侧。
    /// 已经放弃重连的一侧会先被释放，然后重新配对。
    pub async fn pair(&self, side: Side) -> Result<(), GlassesError> {
        let mut pairing = self.pairing.lock().await;

        if pairing
            .session(side)
            .is_some_and(|s| s.connection_state() == ConnectionState::Unavailable)
        {
            pairing.release(side).await;
            self.publish(&pairing);
        }

        let next = pairing.next_side();
        if next != Some(side) {
            return Err(GlassesError::OutOfOrder {
                requested: side,
                next,
            });
        }

        pairing.acquire_next().await?;
        self.publish(&pairing);
        Ok(())
    }

    /// 依次配对左右两侧
    pub async fn pair_all(&self) -> Result<(), GlassesError> {
        let mut pairing = self.pairing.lock().await;
        for side in Side::BOTH {
            if pairing
                .session(side)
                .is_some_and(|s| s.connection_state() == ConnectionState::Unavailable)
            {
                pairing.release(side).await;
            }
        }
        self.publish(&pairing);

        while pairing.next_side().is_some() {
            pairing.acquire_next().await?;
            self.publish(&pairing);
        }

        self.events
            .status(LogLevel::Info, None, "Both devices connected and ready");
        Ok(())
    }

    pub fn both_ready(&self) -> bool {
        self.sessions.borrow().iter().all(|slot| {
            slot.as_ref()
                .is_some_and(|s| s.connection_state() == ConnectionState::Connected)
        })
    }

    pub fn connection_state(&self, side: Side) -> Option<ConnectionState> {
        self.snapshot(side).map(|s| s.connection_state())
    }

    pub async fn send_text(&self, side: Side, text: &str) -> Result<(), GlassesError> {
        if text.is_empty() {
            return Err(GlassesError::EmptyPayload);
        }
        let frames = self.text.frames(text.as_bytes())?;
        self.send_frames(side, &frames, "Message").await
    }

    pub async fn send_bitmap(&self, side: Side, bytes: &[u8]) -> Result<(), GlassesError> {
        if bytes.is_empty() {
            return Err(GlassesError::EmptyPayload);
        }
        let frames = self.bitmap.frames(bytes);
        self.send_frames(side, &frames, "Bitmap").await
    }

    /// 同时发往两侧，一侧失败不影响另一侧
    pub async fn send_text_all(&self, text: &str) -> Vec<(Side, Result<(), GlassesError>)> {
        let (left, right) = tokio::join!(
            self.send_text(Side::Left, text),
            self.send_text(Side::Right, text)
        );
        vec![(Side::Left, left), (Side::Right, right)]
    }

    pub async fn send_bitmap_all(&self, bytes: &[u8]) -> Vec<(Side, Result<(), GlassesError>)> {
        let (left, right) = tokio::join!(
            self.send_bitmap(Side::Left, bytes),
            self.send_bitmap(Side::Right, bytes)
        );
        vec![(Side::Left, left), (Side::Right, right)]
    }

    /// 停止所有心跳并断开两侧
    pub async fn disconnect_all(&self) {
        let mut pairing = self.pairing.lock().await;
        // 先撤下快照，之后的发送立即得到 NotPaired
        self.sessions.send_replace([None, None]);
        pairing.release_all().await;
        drop(pairing);
        self.events
            .status(LogLevel::Info, None, "Devices disconnected");
    }

    fn publish(&self, pairing: &PairingCoordinator<T>) {
        self.sessions
            .send_replace([pairing.session(Side::Left), pairing.session(Side::Right)]);
    }

    fn snapshot(&self, side: Side) -> Option<Arc<LinkSession<T>>> {
        let index = match side {
            Side::Left => 0,
            Side::Right => 1,
        };
        self.sessions.borrow()[index].clone()
    }

    fn session(&self, side: Side) -> Result<Arc<LinkSession<T>>, GlassesError> {
        let session = self.snapshot(side).ok_or(GlassesError::NotPaired(side))?;

        if session.connection_state() == ConnectionState::Unavailable {
            return Err(GlassesError::ReconnectExhausted(side));
        }
        Ok(session)
    }

    async fn send_frames(
        &self,
        side: Side,
        frames: &[Vec<u8>],
        what: &str,
    ) -> Result<(), GlassesError> {
        let session = self.session(side)?;

        let result = async {
            session.ensure_connected().await?;
            session.send_frames(frames, self.pacing).await
        }
        .await;

        match result {
            Ok(()) => {
                self.events.status(
                    LogLevel::Info,
                    Some(side),
                    format!("{what} sent successfully ({} packets)", frames.len()),
                );
                Ok(())
            }
            Err(e) => {
                self.events.status(
                    LogLevel::Error,
                    Some(side),
                    format!("Error sending {}: {e}", what.to_lowercase()),
                );
                Err(e.into())
            }
        }
    }
}
