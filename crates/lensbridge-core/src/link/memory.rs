//! 内存传输
//!
//! 不碰蓝牙硬件的 [`Transport`] 实现：记录每一次写入，
//! 并可以注入各种故障（拒绝连接、写失败、链路掉线、发现延迟）。
//! CLI 的 `--dry-run` 和测试都使用它。

use crate::link::{
    ChannelRole, Discovered, DiscoveryFilter, NotificationSink, Transport, TransportError,
};
use log::debug;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPeripheral {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConnection {
    address: String,
    id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryChannel {
    address: String,
    connection: u64,
    role: ChannelRole,
}

#[derive(Debug)]
struct Device {
    name: String,
    address: String,
    discover_delay: Duration,
    resolve_delay: Duration,
    fail_disconnects: bool,
    live: Option<u64>,
    unreachable: bool,
    refuse_connects: u32,
    /// `None` 表示不限制
    writes_remaining: Option<usize>,
    writes: Vec<Vec<u8>>,
    connects: usize,
    subscribers: Vec<NotificationSink>,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    devices: Mutex<Vec<Device>>,
    next_id: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一副左右镜片
    pub fn with_glasses() -> Self {
        let transport = Self::new();
        transport.add_peripheral("Even G1_00_L_000001", "02:00:00:00:00:01");
        transport.add_peripheral("Even G1_00_R_000002", "02:00:00:00:00:02");
        transport
    }

    pub fn add_peripheral(&self, name: &str, address: &str) {
        self.lock().push(Device {
            name: name.to_string(),
            address: address.to_string(),
            discover_delay: Duration::ZERO,
            resolve_delay: Duration::ZERO,
            fail_disconnects: false,
            live: None,
            unreachable: false,
            refuse_connects: 0,
            writes_remaining: None,
            writes: Vec::new(),
            connects: 0,
            subscribers: Vec::new(),
        });
    }

    /// 设置发现该设备所需的时间
    pub fn set_discover_delay(&self, address: &str, delay: Duration) {
        self.with_device(address, |d| d.discover_delay = delay);
    }

    /// 设置获取每个特征句柄所需的时间
    pub fn set_resolve_delay(&self, address: &str, delay: Duration) {
        self.with_device(address, |d| d.resolve_delay = delay);
    }

    /// 断开请求报错（链路保持原状）
    pub fn fail_disconnects(&self, address: &str, fail: bool) {
        self.with_device(address, |d| d.fail_disconnects = fail);
    }

    /// 接下来 `count` 次连接失败
    pub fn refuse_connects(&self, address: &str, count: u32) {
        self.with_device(address, |d| d.refuse_connects = count);
    }

    /// 设备离开范围：之后的连接全部失败
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        self.with_device(address, |d| d.unreachable = unreachable);
    }

    /// 再成功写入 `count` 次之后，写入全部失败
    pub fn fail_writes_after(&self, address: &str, count: usize) {
        self.with_device(address, |d| d.writes_remaining = Some(count));
    }

    pub fn clear_write_failures(&self, address: &str) {
        self.with_device(address, |d| d.writes_remaining = None);
    }

    /// 模拟链路静默断开
    pub fn drop_link(&self, address: &str) {
        self.with_device(address, |d| {
            d.live = None;
            d.subscribers.clear();
        });
    }

    pub fn is_linked(&self, address: &str) -> bool {
        self.with_device(address, |d| d.live.is_some())
            .unwrap_or(false)
    }

    /// 某设备收到的所有帧
    pub fn writes(&self, address: &str) -> Vec<Vec<u8>> {
        self.with_device(address, |d| d.writes.clone())
            .unwrap_or_default()
    }

    pub fn clear_writes(&self, address: &str) {
        self.with_device(address, |d| d.writes.clear());
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.with_device(address, |d| d.connects).unwrap_or(0)
    }

    /// 以设备身份推送一条通知，返回是否有订阅者
    pub fn push_notification(&self, address: &str, bytes: &[u8]) -> bool {
        self.with_device(address, |d| {
            d.subscribers
                .retain(|sink| sink.send(bytes.to_vec()).is_ok());
            !d.subscribers.is_empty()
        })
        .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Device>> {
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn with_device<R>(&self, address: &str, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        let mut devices = self.lock();
        devices
            .iter_mut()
            .find(|d| d.address.eq_ignore_ascii_case(address))
            .map(f)
    }

    fn live_channel<R>(
        &self,
        channel: &MemoryChannel,
        f: impl FnOnce(&mut Device) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        self.with_device(&channel.address, |d| match d.live {
            None => Err(TransportError::NotConnected),
            Some(id) if id != channel.connection => Err(TransportError::StaleChannel),
            Some(_) => f(d),
        })
        .unwrap_or(Err(TransportError::DeviceNotFound))
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    type Peripheral = MemoryPeripheral;
    type Connection = MemoryConnection;
    type Channel = MemoryChannel;

    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Discovered<MemoryPeripheral>, TransportError> {
        let found = {
            let devices = self.lock();
            devices
                .iter()
                .filter(|d| filter.matches(&d.name, &d.address))
                .min_by_key(|d| d.discover_delay)
                .map(|d| (d.name.clone(), d.address.clone(), d.discover_delay))
        };

        let Some((name, address, delay)) = found else {
            return Err(TransportError::DeviceNotFound);
        };
        if delay > filter.timeout {
            tokio::time::sleep(filter.timeout).await;
            return Err(TransportError::DeviceNotFound);
        }
        tokio::time::sleep(delay).await;

        Ok(Discovered {
            peripheral: MemoryPeripheral {
                address: address.clone(),
            },
            name,
            address,
        })
    }

    async fn connect(
        &self,
        peripheral: &MemoryPeripheral,
    ) -> Result<MemoryConnection, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.with_device(&peripheral.address, |d| {
            if d.unreachable {
                return Err(TransportError::ConnectionFailed("unreachable".to_string()));
            }
            if d.refuse_connects > 0 {
                d.refuse_connects -= 1;
                return Err(TransportError::ConnectionFailed("refused".to_string()));
            }
            d.live = Some(id);
            d.connects += 1;
            d.subscribers.clear();
            Ok(MemoryConnection {
                address: d.address.clone(),
                id,
            })
        })
        .unwrap_or(Err(TransportError::DeviceNotFound))
    }

    async fn resolve_channel(
        &self,
        connection: &MemoryConnection,
        role: ChannelRole,
    ) -> Result<MemoryChannel, TransportError> {
        let delay = self
            .with_device(&connection.address, |d| d.resolve_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let channel = MemoryChannel {
            address: connection.address.clone(),
            connection: connection.id,
            role,
        };
        self.live_channel(&channel, |_| Ok(()))?;
        Ok(channel)
    }

    async fn write(&self, channel: &MemoryChannel, bytes: &[u8]) -> Result<(), TransportError> {
        if channel.role != ChannelRole::Write {
            return Err(TransportError::WriteFailed("not a write channel".to_string()));
        }
        self.live_channel(channel, |d| {
            match d.writes_remaining.as_mut() {
                Some(0) => return Err(TransportError::WriteFailed("injected".to_string())),
                Some(n) => *n -= 1,
                None => {}
            }
            debug!("memory write {} <- {:02x?}", d.address, bytes);
            d.writes.push(bytes.to_vec());
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        channel: &MemoryChannel,
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        self.live_channel(channel, |d| {
            d.subscribers.push(sink);
            Ok(())
        })
    }

    async fn is_connected(&self, connection: &MemoryConnection) -> bool {
        self.with_device(&connection.address, |d| d.live == Some(connection.id))
            .unwrap_or(false)
    }

    async fn disconnect(&self, connection: &MemoryConnection) -> Result<(), TransportError> {
        self.with_device(&connection.address, |d| {
            if d.fail_disconnects {
                return Err(TransportError::ConnectionFailed(
                    "disconnect refused".to_string(),
                ));
            }
            if d.live == Some(connection.id) {
                d.live = None;
                d.subscribers.clear();
            }
            Ok(())
        })
        .unwrap_or(Err(TransportError::DeviceNotFound))
    }
}
