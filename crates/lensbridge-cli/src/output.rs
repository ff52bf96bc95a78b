//! 事件输出
//!
//! 状态消息直接打印给用户，其余事件走 tracing。

use lensbridge_core::GlassesEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn spawn_printer(mut rx: mpsc::Receiver<GlassesEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    })
}

fn print_event(event: &GlassesEvent) {
    match event {
        GlassesEvent::Status(entry) => println!("{entry}"),
        GlassesEvent::Paired {
            side,
            name,
            address,
        } => println!("🔗 [{side}] {name} ({address})"),
        GlassesEvent::FrameSent { side, index, total } => {
            tracing::debug!("[{}] packet {}/{}", side, index + 1, total);
        }
        GlassesEvent::HeartbeatSent { side, seq } => {
            tracing::debug!("[{}] heartbeat seq={}", side, seq);
        }
        GlassesEvent::Notification { side, notification } => {
            tracing::info!("[{}] {}", side, notification);
        }
        other => tracing::debug!("{:?}", other),
    }
}
