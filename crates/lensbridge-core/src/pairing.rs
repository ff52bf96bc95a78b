//! 配对协调器
//!
//! 负责获取左右两个镜片的会话。左右完全按顺序分配：
//! 第一次成功获取的永远是左侧，第二次是右侧，与设备被发现的快慢无关。
//! 协调器内部不重试，失败后由调用方决定是否再次调用。

use crate::events::{EventSink, GlassesEvent};
use crate::link::{
    ConnectionState, DiscoveryFilter, LinkSession, LivenessConfig, LivenessMonitor,
    MonitorState, Side, Transport, TransportError,
};
use crate::logging::LogLevel;
use log::info;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("{side} pairing failed: {source}")]
    PairingFailed {
        side: Side,
        #[source]
        source: TransportError,
    },

    #[error("Both lenses are already paired")]
    AlreadyPaired,
}

struct PairedLens<T: Transport> {
    session: Arc<LinkSession<T>>,
    monitor: LivenessMonitor<T>,
}

pub struct PairingCoordinator<T: Transport> {
    transport: Arc<T>,
    filter: DiscoveryFilter,
    liveness: LivenessConfig,
    events: EventSink,
    left: Option<PairedLens<T>>,
    right: Option<PairedLens<T>>,
}

impl<T: Transport> PairingCoordinator<T> {
    pub fn new(
        transport: Arc<T>,
        filter: DiscoveryFilter,
        liveness: LivenessConfig,
        events: EventSink,
    ) -> Self {
        Self {
            transport,
            filter,
            liveness,
            events,
            left: None,
            right: None,
        }
    }

    /// 下一次 [`acquire_next`](Self::acquire_next) 将获取的一侧
    pub fn next_side(&self) -> Option<Side> {
        match (&self.left, &self.right) {
            (None, _) => Some(Side::Left),
            (Some(_), None) => Some(Side::Right),
            (Some(_), Some(_)) => None,
        }
    }

    /// 发现并连接下一个镜片，成功后启动它的心跳
    pub async fn acquire_next(&mut self) -> Result<Arc<LinkSession<T>>, PairingError> {
        let side = self.next_side().ok_or(PairingError::AlreadyPaired)?;

        let mut filter = self.filter.clone();
        filter.exclude = self.held_addresses();

        self.events.status(
            LogLevel::Info,
            Some(side),
            format!("Scanning for {side} device..."),
        );
        let discovered = self
            .transport
            .discover(&filter)
            .await
            .map_err(|source| PairingError::PairingFailed { side, source })?;

        self.events.status(
            LogLevel::Info,
            Some(side),
            format!("Device found: {}. Connecting...", discovered.name),
        );
        let session = LinkSession::open(
            side,
            discovered,
            self.transport.clone(),
            self.events.clone(),
        )
        .await
        .map_err(|e| PairingError::PairingFailed {
            side,
            source: e.into_transport(),
        })?;

        let mut monitor = LivenessMonitor::new(session.clone(), self.liveness, self.events.clone());
        monitor.start();

        info!(
            "{} lens paired: {} ({})",
            side,
            session.name(),
            session.address()
        );
        self.events.emit(GlassesEvent::Paired {
            side,
            name: session.name().to_string(),
            address: session.address().to_string(),
        });

        let paired = PairedLens {
            session: session.clone(),
            monitor,
        };
        match side {
            Side::Left => self.left = Some(paired),
            Side::Right => self.right = Some(paired),
        }
        Ok(session)
    }

    pub fn session(&self, side: Side) -> Option<Arc<LinkSession<T>>> {
        self.slot(side).map(|p| p.session.clone())
    }

    pub fn monitor_state(&self, side: Side) -> Option<MonitorState> {
        self.slot(side).map(|p| p.monitor.state())
    }

    /// 两侧都已配对且都处于已连接状态
    pub fn both_ready(&self) -> bool {
        Side::BOTH.iter().all(|&side| {
            self.slot(side)
                .is_some_and(|p| p.session.connection_state() == ConnectionState::Connected)
        })
    }

    /// 释放一侧：先停心跳，再断开传输，最后清空槽位
    pub async fn release(&mut self, side: Side) -> bool {
        let slot = match side {
            Side::Left => self.left.take(),
            Side::Right => self.right.take(),
        };
        let Some(mut paired) = slot else {
            return false;
        };

        paired.monitor.stop().await;
        paired.session.close().await;

        self.events.emit(GlassesEvent::Released { side });
        self.events
            .status(LogLevel::Info, Some(side), format!("{side} device disconnected"));
        true
    }

    pub async fn release_all(&mut self) {
        for side in Side::BOTH {
            self.release(side).await;
        }
    }

    fn slot(&self, side: Side) -> Option<&PairedLens<T>> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }

    fn held_addresses(&self) -> Vec<String> {
        Side::BOTH
            .iter()
            .filter_map(|&side| self.slot(side))
            .map(|p| p.session.address().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryTransport;
    use std::time::Duration;

    fn coordinator(transport: &Arc<MemoryTransport>) -> PairingCoordinator<MemoryTransport> {
        PairingCoordinator::new(
            transport.clone(),
            DiscoveryFilter::default(),
            LivenessConfig::default(),
            EventSink::disabled(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_positional_sides() {
        let transport = Arc::new(MemoryTransport::with_glasses());
        let mut pairing = coordinator(&transport);
        assert_eq!(pairing.next_side(), Some(Side::Left));

        let left = pairing.acquire_next().await.unwrap();
        assert_eq!(left.side(), Side::Left);
        assert!(!pairing.both_ready());

        let right = pairing.acquire_next().await.unwrap();
        assert_eq!(right.side(), Side::Right);
        assert_ne!(left.address(), right.address());
        assert!(pairing.both_ready());
        assert_eq!(pairing.monitor_state(Side::Left), Some(MonitorState::Active));

        assert!(matches!(
            pairing.acquire_next().await,
            Err(PairingError::AlreadyPaired)
        ));
        pairing.release_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_found_is_left_regardless_of_name() {
        let transport = Arc::new(MemoryTransport::new());
        transport.add_peripheral("Even G1_L", "AA:01");
        transport.add_peripheral("Even G1_R", "AA:02");
        transport.set_discover_delay("AA:01", Duration::from_millis(900));
        transport.set_discover_delay("AA:02", Duration::from_millis(100));

        let mut pairing = coordinator(&transport);
        let first = pairing.acquire_next().await.unwrap();
        assert_eq!(first.side(), Side::Left);
        assert_eq!(first.address(), "AA:02");

        let second = pairing.acquire_next().await.unwrap();
        assert_eq!(second.side(), Side::Right);
        assert_eq!(second.address(), "AA:01");
        pairing.release_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_consume_side() {
        let transport = Arc::new(MemoryTransport::with_glasses());
        transport.set_unreachable("02:00:00:00:00:01", true);
        let mut pairing = coordinator(&transport);

        let err = pairing.acquire_next().await.unwrap_err();
        assert!(matches!(
            err,
            PairingError::PairingFailed {
                side: Side::Left,
                ..
            }
        ));
        assert_eq!(pairing.next_side(), Some(Side::Left));

        transport.set_unreachable("02:00:00:00:00:01", false);
        assert_eq!(pairing.acquire_next().await.unwrap().side(), Side::Left);
        pairing.release_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_device_found() {
        let transport = Arc::new(MemoryTransport::new());
        let mut pairing = coordinator(&transport);
        assert!(matches!(
            pairing.acquire_next().await,
            Err(PairingError::PairingFailed {
                source: TransportError::DeviceNotFound,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_stops_heartbeats_and_restarts_from_left() {
        let transport = Arc::new(MemoryTransport::with_glasses());
        let mut pairing = coordinator(&transport);
        let left = pairing.acquire_next().await.unwrap();
        pairing.acquire_next().await.unwrap();
        let left_addr = left.address().to_string();

        assert!(pairing.release(Side::Left).await);
        assert!(!pairing.release(Side::Left).await);
        assert!(!transport.is_linked(&left_addr));
        assert!(pairing.session(Side::Left).is_none());
        assert!(!pairing.both_ready());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(transport.writes(&left_addr).is_empty());

        assert_eq!(pairing.next_side(), Some(Side::Left));
        let again = pairing.acquire_next().await.unwrap();
        assert_eq!(again.side(), Side::Left);
        assert_eq!(again.address(), left_addr);
        pairing.release_all().await;
    }
}
