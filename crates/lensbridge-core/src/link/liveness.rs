//! 心跳与自动重连
//!
//! 每个会话一个后台任务：
//!
//! ```text
//! Idle --start--> Active --stop--> Suspended --start--> Active
//!                   │
//!                   └── 重连耗尽 ──> Suspended（会话标记为 Unavailable）
//! ```
//!
//! 每个周期：已连接则发心跳；未连接或心跳失败则进入重连流程，
//! 最多尝试固定次数，每次之间等待固定间隔（不做指数退避）。

use crate::events::{EventSink, GlassesEvent};
use crate::link::{LinkSession, Transport};
use crate::logging::LogLevel;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 心跳与重连参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(5000),
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Active,
    Suspended,
}

enum Recovery {
    Restored,
    Exhausted,
    Cancelled,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LivenessMonitor<T: Transport> {
    session: Arc<LinkSession<T>>,
    config: LivenessConfig,
    events: EventSink,
    state: Arc<watch::Sender<MonitorState>>,
    running: Option<Running>,
}

impl<T: Transport> LivenessMonitor<T> {
    pub fn new(session: Arc<LinkSession<T>>, config: LivenessConfig, events: EventSink) -> Self {
        let (state, _) = watch::channel(MonitorState::Idle);
        Self {
            session,
            config,
            events,
            state: Arc::new(state),
            running: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    /// 启动心跳任务；已在运行时不做任何事
    pub fn start(&mut self) {
        if let Some(running) = &self.running {
            if !running.handle.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.session.clone(),
            self.config,
            self.events.clone(),
            self.state.clone(),
            cancel.clone(),
        ));
        self.state.send_replace(MonitorState::Active);
        self.running = Some(Running { cancel, handle });
        debug!("{}: liveness monitor started", self.session.side());
    }

    /// 停止心跳任务并等待其退出
    ///
    /// 返回之后不会再有心跳打到这个会话上，可以安全地拆除传输连接。
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!("{}: liveness task ended abnormally: {}", self.session.side(), e);
            }
        }
        if self.state() == MonitorState::Active {
            self.state.send_replace(MonitorState::Suspended);
        }
        debug!("{}: liveness monitor stopped", self.session.side());
    }
}

impl<T: Transport> Drop for LivenessMonitor<T> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

async fn run<T: Transport>(
    session: Arc<LinkSession<T>>,
    config: LivenessConfig,
    events: EventSink,
    state: Arc<watch::Sender<MonitorState>>,
    cancel: CancellationToken,
) {
    let period = config.heartbeat_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let healthy = if session.is_connected().await {
            match session.send_heartbeat().await {
                Ok(_) => true,
                Err(e) => {
                    warn!("{}: heartbeat failed: {}", session.side(), e);
                    false
                }
            }
        } else {
            false
        };

        if healthy {
            continue;
        }

        match recover(&session, &config, &events, &cancel).await {
            // 重新武装心跳定时器
            Recovery::Restored => ticker.reset(),
            Recovery::Cancelled => break,
            Recovery::Exhausted => {
                state.send_replace(MonitorState::Suspended);
                break;
            }
        }
    }
}

/// 重连流程：连接、重新获取特征、重新订阅通知
async fn recover<T: Transport>(
    session: &LinkSession<T>,
    config: &LivenessConfig,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Recovery {
    let side = session.side();
    let max = config.max_reconnect_attempts;

    for attempt in 1..=max {
        // 等待期间发送路径可能已经把链路恢复了
        if attempt > 1 && session.is_connected().await {
            debug!("{}: link restored elsewhere, skipping reconnect", side);
            return Recovery::Restored;
        }

        events.emit(GlassesEvent::Reconnecting { side, attempt, max });
        events.status(
            LogLevel::Info,
            Some(side),
            format!("Reconnecting ({attempt}/{max})..."),
        );

        // 不在连接中途取消：半建立的连接必须先存进会话，close() 才能断开它
        let result = session.reconnect().await;
        if cancel.is_cancelled() {
            return Recovery::Cancelled;
        }

        match result {
            Ok(()) => {
                events.emit(GlassesEvent::Reconnected { side, attempt });
                events.status(LogLevel::Info, Some(side), "Reconnected");
                return Recovery::Restored;
            }
            Err(e) => warn!("{}: reconnect attempt {}/{} failed: {}", side, attempt, max, e),
        }

        if attempt < max {
            tokio::select! {
                () = cancel.cancelled() => return Recovery::Cancelled,
                () = time::sleep(config.reconnect_backoff) => {}
            }
        }
    }

    session.mark_unavailable().await;
    events.emit(GlassesEvent::ReconnectExhausted {
        side,
        attempts: max,
    });
    events.status(
        LogLevel::Error,
        Some(side),
        format!("Gave up after {max} reconnect attempts, pair again to continue"),
    );
    Recovery::Exhausted
}
