//! 链路层
//!
//! - **session**: 单个镜片的连接会话（句柄、序号、互斥发送）
//! - **liveness**: 心跳与有限次数的自动重连
//! - **btle**: 基于 btleplug 的真实 BLE 传输
//! - **memory**: 内存传输，用于演练和测试
//!
//! 引擎本身只依赖 [`Transport`] 抽象，不关心底层无线实现。

pub mod btle;
pub mod liveness;
pub mod memory;
pub mod session;

pub use btle::BtleTransport;
pub use liveness::{LivenessConfig, LivenessMonitor, MonitorState};
pub use memory::MemoryTransport;
pub use session::{LinkSession, SessionError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Nordic UART 服务
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// 写特征（主机 -> 眼镜）
pub const UART_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// 通知特征（眼镜 -> 主机）
pub const UART_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// 镜片位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub fn name(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 会话的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// 自动重连已耗尽，需要重新配对
    Unavailable,
}

/// 特征的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Write,
    Notify,
}

/// 设备发现条件
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    /// 设备名前缀
    pub name_prefix: String,
    pub service: Uuid,
    pub write_char: Uuid,
    pub notify_char: Uuid,
    /// 已经被占用的设备地址
    pub exclude: Vec<String>,
    pub timeout: Duration,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            name_prefix: "Even".to_string(),
            service: UART_SERVICE_UUID,
            write_char: UART_WRITE_CHAR_UUID,
            notify_char: UART_NOTIFY_CHAR_UUID,
            exclude: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl DiscoveryFilter {
    pub fn matches(&self, name: &str, address: &str) -> bool {
        name.starts_with(&self.name_prefix)
            && !self
                .exclude
                .iter()
                .any(|a| a.eq_ignore_ascii_case(address))
    }

    pub fn char_uuid(&self, role: ChannelRole) -> Uuid {
        match role {
            ChannelRole::Write => self.write_char,
            ChannelRole::Notify => self.notify_char,
        }
    }
}

/// 发现到的外设
#[derive(Debug, Clone)]
pub struct Discovered<P> {
    pub peripheral: P,
    pub name: String,
    pub address: String,
}

/// 通知字节的接收端
pub type NotificationSink = mpsc::UnboundedSender<Vec<u8>>;

/// 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Not connected")]
    NotConnected,

    #[error("Channel belongs to a previous connection")]
    StaleChannel,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),
}

/// 引擎消费的传输能力
///
/// 句柄均为不透明值。通道句柄与产生它的连接绑定，
/// 重连之后必须重新 [`resolve_channel`](Transport::resolve_channel)。
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Peripheral: Clone + Send + Sync + 'static;
    type Connection: Clone + Send + Sync + 'static;
    type Channel: Clone + Send + Sync + 'static;

    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Discovered<Self::Peripheral>, TransportError>;

    async fn connect(
        &self,
        peripheral: &Self::Peripheral,
    ) -> Result<Self::Connection, TransportError>;

    async fn resolve_channel(
        &self,
        connection: &Self::Connection,
        role: ChannelRole,
    ) -> Result<Self::Channel, TransportError>;

    async fn write(&self, channel: &Self::Channel, bytes: &[u8]) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        channel: &Self::Channel,
        sink: NotificationSink,
    ) -> Result<(), TransportError>;

    async fn is_connected(&self, connection: &Self::Connection) -> bool;

    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let mut filter = DiscoveryFilter::default();
        assert!(filter.matches("Even G1_12_L_ABCD", "AA:BB"));
        assert!(!filter.matches("Other", "AA:BB"));

        filter.exclude.push("aa:bb".to_string());
        assert!(!filter.matches("Even G1_12_L_ABCD", "AA:BB"));
    }

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Left.to_string(), "left");
        assert_eq!(Side::BOTH, [Side::Left, Side::Right]);
    }
}
