//! Lensbridge Core Library
//!
//! 双镜片 BLE 智能眼镜（Even G1 等）的通信核心库
//!
//! # 模块
//!
//! - **protocol**: 分包、CRC 校验、心跳帧、通知解码
//! - **link**: 传输抽象、单侧会话、心跳与自动重连
//! - **pairing**: 按顺序分配左右镜片
//! - **workflow**: 面向 UI 的高层 API
//! - **events**: 状态、进度事件流
//!
//! # 使用示例
//!
//! ```ignore
//! use lensbridge_core::{AppSettings, BtleTransport, EventSink, Glasses, Side};
//!
//! let settings = AppSettings::load();
//! let transport = BtleTransport::new(&settings.discovery_filter()).await?;
//! let (events, mut rx) = EventSink::channel(256);
//!
//! let glasses = Glasses::new(Arc::new(transport), &settings, events)?;
//! glasses.pair_all().await?;
//! glasses.send_text(Side::Left, "Hello").await?;
//! glasses.disconnect_all().await;
//! ```

pub mod config;
pub mod events;
pub mod link;
pub mod logging;
pub mod pairing;
pub mod protocol;
pub mod workflow;

pub use config::{AppSettings, ConfigError};
pub use events::{DEFAULT_EVENT_CAPACITY, EventSink, GlassesEvent};
pub use link::{
    BtleTransport, ConnectionState, DiscoveryFilter, LinkSession, LivenessConfig,
    LivenessMonitor, MemoryTransport, MonitorState, SessionError, Side, Transport,
    TransportError,
};
pub use logging::{LogEntry, LogLevel};
pub use pairing::{PairingCoordinator, PairingError};
pub use protocol::{BitmapFramer, FramingError, Notification, TextFramer};
pub use workflow::{Glasses, GlassesError};
