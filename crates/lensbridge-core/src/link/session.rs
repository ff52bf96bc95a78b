//! 链路会话
//!
//! 一个 [`LinkSession`] 对应一个已配对的镜片。它独占传输句柄，
//! 持有写/通知两个特征句柄以及心跳计数器。
//!
//! 会话内部的 `Mutex` 是每侧唯一的互斥边界：一次多帧发送在完成（或失败）
//! 之前一直持有锁，心跳也要拿同一把锁，所以心跳不会插进一组分包中间。
//! 左右两侧各有自己的会话，互不影响。

use crate::events::{EventSink, GlassesEvent};
use crate::link::{
    ChannelRole, ConnectionState, Discovered, NotificationSink, Side, Transport, TransportError,
};
use crate::logging::LogLevel;
use crate::protocol::{HeartbeatFrame, decode_notification};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time;

/// 心跳计数器取值范围 0..=254
const HEARTBEAT_MODULUS: u16 = 255;

/// 会话错误
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{side} connect failed: {source}")]
    ConnectFailed {
        side: Side,
        #[source]
        source: TransportError,
    },

    #[error("{side} write failed after {sent} of {total} frames: {source}")]
    TransportWriteFailed {
        side: Side,
        sent: usize,
        total: usize,
        #[source]
        source: TransportError,
    },
}

impl SessionError {
    pub fn side(&self) -> Side {
        match self {
            SessionError::ConnectFailed { side, .. }
            | SessionError::TransportWriteFailed { side, .. } => *side,
        }
    }

    /// 取出底层传输错误
    pub fn into_transport(self) -> TransportError {
        match self {
            SessionError::ConnectFailed { source, .. }
            | SessionError::TransportWriteFailed { source, .. } => source,
        }
    }
}

/// 与某次连接绑定的可变状态
struct LinkState<T: Transport> {
    connection: Option<T::Connection>,
    write: Option<T::Channel>,
    notify: Option<T::Channel>,
    heartbeat_seq: u8,
}

impl<T: Transport> LinkState<T> {
    fn clear_channels(&mut self) {
        self.write = None;
        self.notify = None;
    }
}

pub struct LinkSession<T: Transport> {
    side: Side,
    name: String,
    address: String,
    transport: Arc<T>,
    peripheral: T::Peripheral,
    link: Mutex<LinkState<T>>,
    state: watch::Sender<ConnectionState>,
    inbound: NotificationSink,
    events: EventSink,
}

impl<T: Transport> std::fmt::Debug for LinkSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("side", &self.side)
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> LinkSession<T> {
    /// 为已发现的外设建立会话并完成首次连接
    pub async fn open(
        side: Side,
        discovered: Discovered<T::Peripheral>,
        transport: Arc<T>,
        events: EventSink,
    ) -> Result<Arc<Self>, SessionError> {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let session = Arc::new(Self {
            side,
            name: discovered.name,
            address: discovered.address,
            transport,
            peripheral: discovered.peripheral,
            link: Mutex::new(LinkState {
                connection: None,
                write: None,
                notify: None,
                heartbeat_seq: 0,
            }),
            state,
            inbound,
            events: events.clone(),
        });

        tokio::spawn(decode_inbound(side, inbound_rx, events));

        session.ensure_connected().await?;
        Ok(session)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 最近一次记录的连接状态（不访问传输层）
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 下一次心跳将使用的序号
    pub async fn heartbeat_counter(&self) -> u8 {
        self.link.lock().await.heartbeat_seq
    }

    /// 询问传输层连接是否仍然有效，并据此刷新状态
    pub async fn is_connected(&self) -> bool {
        let link = self.link.lock().await;
        self.probe_locked(&link).await
    }

    /// 如果已断开则重连并重新获取特征句柄；已连接时直接返回
    pub async fn ensure_connected(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        if self.probe_locked(&link).await {
            return Ok(());
        }
        self.connect_locked(&mut link).await
    }

    /// 无条件重建连接：重新连接、重新获取两个特征句柄、重新订阅通知
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.connect_locked(&mut link).await
    }

    /// 写一帧
    pub async fn send(&self, frame: &[u8]) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.write_locked(&mut link, frame)
            .await
            .map_err(|source| SessionError::TransportWriteFailed {
                side: self.side,
                sent: 0,
                total: 1,
                source,
            })
    }

    /// 按顺序写出一组帧，每帧之后等待 `pacing`
    ///
    /// 整个过程持有会话锁。任何一帧失败都会中止剩余的帧，
    /// 错误中携带已成功写出的帧数。
    pub async fn send_frames(
        &self,
        frames: &[Vec<u8>],
        pacing: Duration,
    ) -> Result<(), SessionError> {
        let total = frames.len();
        let mut link = self.link.lock().await;

        for (index, frame) in frames.iter().enumerate() {
            if let Err(source) = self.write_locked(&mut link, frame).await {
                warn!(
                    "{}: frame {}/{} failed: {}",
                    self.side,
                    index + 1,
                    total,
                    source
                );
                return Err(SessionError::TransportWriteFailed {
                    side: self.side,
                    sent: index,
                    total,
                    source,
                });
            }

            self.events.emit(GlassesEvent::FrameSent {
                side: self.side,
                index,
                total,
            });
            time::sleep(pacing).await;
        }

        Ok(())
    }

    /// 发送一次心跳，返回本次使用的序号
    ///
    /// 无论写入成功与否计数器都会前进。
    pub async fn send_heartbeat(&self) -> Result<u8, SessionError> {
        let mut link = self.link.lock().await;
        let seq = link.heartbeat_seq;
        link.heartbeat_seq = next_heartbeat_seq(seq);

        let frame = HeartbeatFrame::build(seq);
        self.write_locked(&mut link, &frame)
            .await
            .map_err(|source| SessionError::TransportWriteFailed {
                side: self.side,
                sent: 0,
                total: 1,
                source,
            })?;

        debug!("{}: heartbeat seq={}", self.side, seq);
        self.events.emit(GlassesEvent::HeartbeatSent {
            side: self.side,
            seq,
        });
        Ok(seq)
    }

    /// 自动重连耗尽后调用，直到重新配对前拒绝发送
    pub async fn mark_unavailable(&self) {
        let mut link = self.link.lock().await;
        link.clear_channels();
        self.set_state(ConnectionState::Unavailable);
    }

    /// 主动断开并释放传输连接
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        link.clear_channels();
        if let Some(connection) = link.connection.take() {
            if let Err(e) = self.transport.disconnect(&connection).await {
                warn!("{}: disconnect failed: {}", self.side, e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("{}: session closed", self.side);
    }

    async fn probe_locked(&self, link: &LinkState<T>) -> bool {
        let alive = match (&link.connection, &link.write, &link.notify) {
            (Some(connection), Some(_), Some(_)) => self.transport.is_connected(connection).await,
            _ => false,
        };

        if !alive && self.connection_state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            self.events.status(
                LogLevel::Warn,
                Some(self.side),
                format!("{} device disconnected", self.side),
            );
        }
        alive && self.connection_state() == ConnectionState::Connected
    }

    async fn connect_locked(&self, link: &mut LinkState<T>) -> Result<(), SessionError> {
        // 旧句柄属于上一次连接，先作废
        link.clear_channels();
        if let Some(stale) = link.connection.take() {
            if let Err(e) = self.transport.disconnect(&stale).await {
                warn!("{}: failed to drop stale connection: {}", self.side, e);
            }
        }

        let result = self.establish().await;
        match result {
            Ok((connection, write, notify)) => {
                link.connection = Some(connection);
                link.write = Some(write);
                link.notify = Some(notify);
                self.set_state(ConnectionState::Connected);
                info!("{}: connected to {}", self.side, self.address);
                Ok(())
            }
            Err(source) => {
                if self.connection_state() == ConnectionState::Connected {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(SessionError::ConnectFailed {
                    side: self.side,
                    source,
                })
            }
        }
    }

    async fn establish(&self) -> Result<(T::Connection, T::Channel, T::Channel), TransportError> {
        debug!("{}: connecting to {}", self.side, self.address);
        let connection = self.transport.connect(&self.peripheral).await?;

        let channels = async {
            let write = self
                .transport
                .resolve_channel(&connection, ChannelRole::Write)
                .await?;
            let notify = self
                .transport
                .resolve_channel(&connection, ChannelRole::Notify)
                .await?;
            self.transport
                .subscribe(&notify, self.inbound.clone())
                .await?;
            Ok::<_, TransportError>((write, notify))
        }
        .await;

        match channels {
            Ok((write, notify)) => Ok((connection, write, notify)),
            Err(e) => {
                warn!(
                    "{}: channel setup failed on {}: {}",
                    self.side, self.address, e
                );
                if let Err(e) = self.transport.disconnect(&connection).await {
                    warn!("{}: disconnect after failed setup: {}", self.side, e);
                }
                Err(e)
            }
        }
    }

    async fn write_locked(
        &self,
        link: &mut LinkState<T>,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let Some(channel) = &link.write else {
            return Err(TransportError::NotConnected);
        };

        let result = self.transport.write(channel, bytes).await;
        if result.is_err() {
            // 写失败时确认一下链路是否已经断开
            self.probe_locked(link).await;
        }
        result
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            self.events.emit(GlassesEvent::ConnectionChanged {
                side: self.side,
                state,
            });
        }
    }
}

/// 心跳序号按 255 取模递增
pub fn next_heartbeat_seq(seq: u8) -> u8 {
    ((u16::from(seq) + 1) % HEARTBEAT_MODULUS) as u8
}

async fn decode_inbound(
    side: Side,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events: EventSink,
) {
    while let Some(bytes) = inbound.recv().await {
        let notification = decode_notification(&bytes);
        debug!("{}: notification {}", side, notification);
        events.emit(GlassesEvent::Notification { side, notification });
    }
}
