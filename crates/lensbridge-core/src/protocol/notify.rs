//! 通知解码
//!
//! 解释眼镜通过 notify 特征主动推送的字节，仅用于诊断和日志，
//! 不参与任何协议控制决策。

use super::{
    CMD_BITMAP, CMD_CRC, CMD_DEVICE_EVENT, CMD_END, CMD_HEARTBEAT, CMD_TEXT, RESPONSE_FAILURE,
    RESPONSE_SUCCESS,
};
use std::fmt;

/// 心跳回显中序号的位置: `[0x25, len_lo, len_hi, seq, 0x04, seq]`
const HEARTBEAT_SEQ_OFFSET: usize = 3;

/// 应答状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Success,
    Failure,
    Other(u8),
    Missing,
}

impl AckStatus {
    fn from_byte(byte: Option<u8>) -> Self {
        match byte {
            Some(RESPONSE_SUCCESS) => AckStatus::Success,
            Some(RESPONSE_FAILURE) => AckStatus::Failure,
            Some(b) => AckStatus::Other(b),
            None => AckStatus::Missing,
        }
    }
}

/// 解码后的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// 心跳回显；`seq` 为 `None` 表示帧太短
    Heartbeat { seq: Option<u8> },
    TextAck(AckStatus),
    BitmapAck(AckStatus),
    /// CRC 应答: `[0x16, crc0..crc3, status]`
    CrcAck(AckStatus),
    TransferEndAck(AckStatus),
    DeviceEvent { code: Option<u8> },
    Unknown { command: Option<u8>, len: usize },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Heartbeat { seq: Some(seq) } => write!(f, "heartbeat echo seq={seq}"),
            Notification::Heartbeat { seq: None } => write!(f, "heartbeat echo (truncated)"),
            Notification::TextAck(s) => write!(f, "text ack {s:?}"),
            Notification::BitmapAck(s) => write!(f, "bitmap ack {s:?}"),
            Notification::CrcAck(s) => write!(f, "crc ack {s:?}"),
            Notification::TransferEndAck(s) => write!(f, "transfer end ack {s:?}"),
            Notification::DeviceEvent { code: Some(c) } => write!(f, "device event 0x{c:02X}"),
            Notification::DeviceEvent { code: None } => write!(f, "device event"),
            Notification::Unknown {
                command: Some(c),
                len,
            } => write!(f, "unknown 0x{c:02X} ({len} bytes)"),
            Notification::Unknown { command: None, .. } => write!(f, "empty notification"),
        }
    }
}

/// 解码一条通知
pub fn decode_notification(bytes: &[u8]) -> Notification {
    let Some(&command) = bytes.first() else {
        return Notification::Unknown {
            command: None,
            len: 0,
        };
    };

    match command {
        CMD_HEARTBEAT => Notification::Heartbeat {
            seq: bytes.get(HEARTBEAT_SEQ_OFFSET).copied(),
        },
        CMD_TEXT => Notification::TextAck(AckStatus::from_byte(bytes.get(1).copied())),
        CMD_BITMAP => Notification::BitmapAck(AckStatus::from_byte(bytes.get(1).copied())),
        CMD_CRC => Notification::CrcAck(AckStatus::from_byte(bytes.get(5).copied())),
        CMD_END => Notification::TransferEndAck(AckStatus::from_byte(bytes.get(1).copied())),
        CMD_DEVICE_EVENT => Notification::DeviceEvent {
            code: bytes.get(1).copied(),
        },
        other => Notification::Unknown {
            command: Some(other),
            len: bytes.len(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HeartbeatFrame;

    #[test]
    fn test_heartbeat_echo() {
        let echo = HeartbeatFrame::build(42);
        assert_eq!(
            decode_notification(&echo),
            Notification::Heartbeat { seq: Some(42) }
        );
        assert_eq!(
            decode_notification(&[0x25, 0x06]),
            Notification::Heartbeat { seq: None }
        );
    }

    #[test]
    fn test_acks() {
        assert_eq!(
            decode_notification(&[0x4E, 0xC9]),
            Notification::TextAck(AckStatus::Success)
        );
        assert_eq!(
            decode_notification(&[0x20, 0xCA]),
            Notification::TransferEndAck(AckStatus::Failure)
        );
        assert_eq!(
            decode_notification(&[0x16, 1, 2, 3, 4, 0xC9]),
            Notification::CrcAck(AckStatus::Success)
        );
        assert_eq!(
            decode_notification(&[0x15]),
            Notification::BitmapAck(AckStatus::Missing)
        );
    }

    #[test]
    fn test_unknown() {
        assert_eq!(
            decode_notification(&[0x99, 1, 2]),
            Notification::Unknown {
                command: Some(0x99),
                len: 3
            }
        );
        assert_eq!(
            decode_notification(&[]),
            Notification::Unknown {
                command: None,
                len: 0
            }
        );
    }

    #[test]
    fn test_display() {
        let n = decode_notification(&[0xF5, 0x01]);
        assert_eq!(n.to_string(), "device event 0x01");
    }
}
