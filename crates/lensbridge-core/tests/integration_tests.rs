//! 集成测试 - 引擎端到端行为
//!
//! 使用内存传输验证配对、分包发送、心跳和重连在一起时的表现。

use lensbridge_core::protocol::{CMD_BITMAP, CMD_CRC, CMD_HEARTBEAT, CMD_TEXT, END_FRAME, crc32};
use lensbridge_core::{
    AppSettings, ConnectionState, EventSink, FramingError, Glasses, GlassesError, GlassesEvent,
    MemoryTransport, Notification, Side,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const LEFT: &str = "02:00:00:00:00:01";
const RIGHT: &str = "02:00:00:00:00:02";

fn setup() -> (
    Arc<MemoryTransport>,
    Glasses<MemoryTransport>,
    mpsc::Receiver<GlassesEvent>,
) {
    let transport = Arc::new(MemoryTransport::with_glasses());
    let (events, rx) = EventSink::channel(4096);
    let glasses = Glasses::new(transport.clone(), &AppSettings::default(), events).unwrap();
    (transport, glasses, rx)
}

fn drain(rx: &mut mpsc::Receiver<GlassesEvent>) -> Vec<GlassesEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// 45 字节文本：3 帧，共享同一个操作标记
#[tokio::test(start_paused = true)]
async fn test_text_frames_on_the_wire() {
    let (transport, glasses, mut rx) = setup();
    glasses.pair_all().await.unwrap();

    let text = "The quick brown fox jumps over the lazy dog!!";
    assert_eq!(text.len(), 45);
    glasses.send_text(Side::Left, text).await.unwrap();

    let writes = transport.writes(LEFT);
    assert_eq!(writes.len(), 3);
    let tag = writes[0][1];
    for (i, frame) in writes.iter().enumerate() {
        assert_eq!(frame[0], CMD_TEXT);
        assert_eq!(frame[1], tag);
        assert_eq!(frame[2], 3);
        assert_eq!(frame[3], i as u8);
        assert_eq!(&frame[4..9], &[0x71, 0x00, 0x00, 0x00, 0x01]);
    }
    let body: Vec<u8> = writes.iter().flat_map(|f| f[9..].to_vec()).collect();
    assert_eq!(body, text.as_bytes());
    assert!(transport.writes(RIGHT).is_empty());

    let progress: Vec<usize> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            GlassesEvent::FrameSent {
                side: Side::Left,
                index,
                total: 3,
            } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 1, 2]);

    glasses.disconnect_all().await;
}

/// 超过 255 帧的文本在任何写入之前被拒绝
#[tokio::test(start_paused = true)]
async fn test_oversized_text_never_touches_the_link() {
    let (transport, glasses, _rx) = setup();
    glasses.pair_all().await.unwrap();

    let results = glasses.send_text_all(&"z".repeat(5101)).await;
    for (_, result) in results {
        assert!(matches!(
            result,
            Err(GlassesError::Framing(FramingError::PayloadTooLarge {
                frames: 256,
                max: 255
            }))
        ));
    }
    assert!(transport.writes(LEFT).is_empty());
    assert!(transport.writes(RIGHT).is_empty());

    // 恰好 255 帧可以发送
    glasses.send_text(Side::Right, &"z".repeat(5100)).await.unwrap();
    let text_frames = transport
        .writes(RIGHT)
        .iter()
        .filter(|f| f[0] == CMD_TEXT)
        .count();
    assert_eq!(text_frames, 255);

    glasses.disconnect_all().await;
}

/// 500 字节位图：3 个数据帧 + CRC + 结束帧
#[tokio::test(start_paused = true)]
async fn test_bitmap_transfer_to_both() {
    let (transport, glasses, _rx) = setup();
    glasses.pair_all().await.unwrap();

    let image: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    let results = glasses.send_bitmap_all(&image).await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    for addr in [LEFT, RIGHT] {
        let writes = transport.writes(addr);
        assert_eq!(writes.len(), 5);

        assert_eq!(&writes[0][..6], &[CMD_BITMAP, 0, 0x00, 0x1C, 0x00, 0x00]);
        assert_eq!(writes[0].len(), 2 + 4 + 194);
        assert_eq!(&writes[1][..2], &[CMD_BITMAP, 1]);
        assert_eq!(writes[2].len(), 2 + 500 - 2 * 194);

        let mut covered = vec![0x00, 0x1C, 0x00, 0x00];
        covered.extend_from_slice(&image);
        let mut crc_frame = vec![CMD_CRC];
        crc_frame.extend_from_slice(&crc32(&covered).to_be_bytes());
        assert_eq!(writes[3], crc_frame);
        assert_eq!(writes[4], END_FRAME.to_vec());
    }

    glasses.disconnect_all().await;
}

/// 心跳不会插进正在发送的帧序列中间
#[tokio::test(start_paused = true)]
async fn test_heartbeat_waits_for_frame_sequence() {
    let (transport, glasses, _rx) = setup();
    glasses.pair(Side::Left).await.unwrap();

    // 200 帧 * 50ms = 10s，跨过 5s 的心跳周期
    glasses.send_text(Side::Left, &"h".repeat(4000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let writes = transport.writes(LEFT);
    assert!(writes.len() > 200);
    assert!(writes[..200].iter().all(|f| f[0] == CMD_TEXT));
    assert!(writes[200..].iter().all(|f| f[0] == CMD_HEARTBEAT));
    assert_eq!(writes[200][3], 0);

    glasses.disconnect_all().await;
}

/// 一侧掉线耗尽重连后，另一侧不受影响；重新配对后恢复
#[tokio::test(start_paused = true)]
async fn test_side_failure_is_isolated_until_repaired() {
    let (transport, glasses, mut rx) = setup();
    glasses.pair_all().await.unwrap();

    transport.drop_link(LEFT);
    transport.set_unreachable(LEFT, true);
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert_eq!(
        glasses.connection_state(Side::Left),
        Some(ConnectionState::Unavailable)
    );
    assert_eq!(
        glasses.connection_state(Side::Right),
        Some(ConnectionState::Connected)
    );
    assert!(!glasses.both_ready());
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        GlassesEvent::ReconnectExhausted {
            side: Side::Left,
            attempts: 3
        }
    )));

    let results = glasses.send_text_all("still here").await;
    assert!(matches!(
        results[0],
        (Side::Left, Err(GlassesError::ReconnectExhausted(Side::Left)))
    ));
    assert!(matches!(results[1], (Side::Right, Ok(()))));

    transport.set_unreachable(LEFT, false);
    glasses.pair(Side::Left).await.unwrap();
    assert!(glasses.both_ready());

    transport.clear_writes(LEFT);
    glasses.send_text(Side::Left, "back").await.unwrap();
    assert_eq!(transport.writes(LEFT).len(), 1);

    glasses.disconnect_all().await;
}

/// 眼镜上行的通知被解码为事件
#[tokio::test(start_paused = true)]
async fn test_inbound_notifications_are_decoded() {
    let (transport, glasses, mut rx) = setup();
    glasses.pair_all().await.unwrap();
    drain(&mut rx);

    assert!(transport.push_notification(RIGHT, &[0x25, 0x06, 0x00, 0x07, 0x04, 0x07]));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        GlassesEvent::Notification {
            side: Side::Right,
            notification: Notification::Heartbeat { seq: Some(7) }
        }
    )));

    glasses.disconnect_all().await;
}

/// 全部断开后不再有心跳，链路全部释放
#[tokio::test(start_paused = true)]
async fn test_disconnect_all_stops_everything() {
    let (transport, glasses, _rx) = setup();
    glasses.pair_all().await.unwrap();
    glasses.disconnect_all().await;

    assert!(!transport.is_linked(LEFT));
    assert!(!transport.is_linked(RIGHT));
    assert_eq!(glasses.connection_state(Side::Left), None);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(transport.writes(LEFT).is_empty());
    assert!(transport.writes(RIGHT).is_empty());

    assert!(matches!(
        glasses.send_text(Side::Left, "gone").await,
        Err(GlassesError::NotPaired(Side::Left))
    ));
}
