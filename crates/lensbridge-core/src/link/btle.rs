//! BLE 传输 - 基于 btleplug 的中心设备实现
//!
//! 流程:
//! 1. 扫描名称以指定前缀开头的外设（跳过已经配对的地址）
//! 2. 连接并发现服务
//! 3. 在 UART 服务下查找写 / 通知特征
//! 4. 订阅通知，把数据转发给会话

use crate::link::{
    ChannelRole, Discovered, DiscoveryFilter, NotificationSink, Transport, TransportError,
};
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use uuid::Uuid;

/// 扫描时轮询已发现外设的间隔
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 连接句柄。btleplug 的连接状态挂在外设对象上
#[derive(Debug, Clone)]
pub struct BtleConnection {
    peripheral: Peripheral,
}

#[derive(Debug, Clone)]
pub struct BtleChannel {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

/// 每个外设至多一个通知转发任务
///
/// btleplug 的通知流挂在外设上而不是某次连接上，
/// 重新订阅前必须先停掉旧任务，否则每条通知会被转发多次。
struct Forwarders<K> {
    tasks: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K: Eq + Hash> Forwarders<K> {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn replace(&self, key: K, task: JoinHandle<()>) {
        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort(&self, key: &K) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl<K> Drop for Forwarders<K> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}

pub struct BtleTransport {
    adapter: Adapter,
    /// 服务与特征 UUID 取自这里
    filter: DiscoveryFilter,
    forwarders: Forwarders<PeripheralId>,
}

impl BtleTransport {
    /// 使用第一个蓝牙适配器
    pub async fn new(filter: &DiscoveryFilter) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        Ok(Self {
            adapter,
            filter: filter.clone(),
            forwarders: Forwarders::new(),
        })
    }

    async fn find_matching(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Option<Discovered<Peripheral>>, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let Some(name) = props.local_name else {
                continue;
            };
            let address = props.address.to_string();
            if filter.matches(&name, &address) {
                debug!("Matched {} ({}) rssi={:?}", name, address, props.rssi);
                return Ok(Some(Discovered {
                    peripheral,
                    name,
                    address,
                }));
            }
        }
        Ok(None)
    }

    fn find_characteristic(
        &self,
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == self.filter.service)
            .ok_or(TransportError::ServiceNotFound(self.filter.service))?;

        service
            .characteristics
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait::async_trait]
impl Transport for BtleTransport {
    type Peripheral = Peripheral;
    type Connection = BtleConnection;
    type Channel = BtleChannel;

    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Discovered<Peripheral>, TransportError> {
        info!(
            "Scanning for '{}*' ({}s)",
            filter.name_prefix,
            filter.timeout.as_secs()
        );
        self.adapter.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + filter.timeout;
        let result = loop {
            match self.find_matching(filter).await {
                Ok(Some(found)) => break Ok(found),
                Ok(None) if Instant::now() >= deadline => break Err(TransportError::DeviceNotFound),
                Ok(None) => time::sleep(SCAN_POLL_INTERVAL).await,
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        result
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<BtleConnection, TransportError> {
        if !peripheral.is_connected().await? {
            peripheral
                .connect()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        }

        // 每次连接都重新发现服务，旧的特征对象不再可信
        peripheral.discover_services().await?;
        Ok(BtleConnection {
            peripheral: peripheral.clone(),
        })
    }

    async fn resolve_channel(
        &self,
        connection: &BtleConnection,
        role: ChannelRole,
    ) -> Result<BtleChannel, TransportError> {
        let uuid = self.filter.char_uuid(role);
        let characteristic = self.find_characteristic(&connection.peripheral, uuid)?;
        Ok(BtleChannel {
            peripheral: connection.peripheral.clone(),
            characteristic,
        })
    }

    async fn write(&self, channel: &BtleChannel, bytes: &[u8]) -> Result<(), TransportError> {
        channel
            .peripheral
            .write(&channel.characteristic, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe(
        &self,
        channel: &BtleChannel,
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        channel.peripheral.subscribe(&channel.characteristic).await?;
        let mut notifications = channel.peripheral.notifications().await?;
        let uuid = channel.characteristic.uuid;

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid && sink.send(notification.value).is_err() {
                    break;
                }
            }
        });
        self.forwarders.replace(channel.peripheral.id(), task);
        Ok(())
    }

    async fn is_connected(&self, connection: &BtleConnection) -> bool {
        connection.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self, connection: &BtleConnection) -> Result<(), TransportError> {
        self.forwarders.abort(&connection.peripheral.id());
        connection.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    /// 任务持有 `tx`，任务被中止后接收端立即关闭
    fn pending_task() -> (JoinHandle<()>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        (task, rx)
    }

    #[tokio::test]
    async fn test_resubscribe_stops_previous_forwarder() {
        let forwarders = Forwarders::new();
        let (first, first_rx) = pending_task();
        let (second, mut second_rx) = pending_task();

        forwarders.replace("AA:01", first);
        forwarders.replace("AA:01", second);

        assert!(first_rx.await.is_err());
        assert!(matches!(
            second_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        forwarders.abort(&"AA:01");
        assert!(second_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_forwarders_are_per_peripheral() {
        let forwarders = Forwarders::new();
        let (left, mut left_rx) = pending_task();
        let (right, right_rx) = pending_task();

        forwarders.replace("AA:01", left);
        forwarders.replace("AA:02", right);
        forwarders.abort(&"AA:02");

        assert!(right_rx.await.is_err());
        assert!(matches!(
            left_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        drop(forwarders);
        assert!(left_rx.await.is_err());
    }
}
