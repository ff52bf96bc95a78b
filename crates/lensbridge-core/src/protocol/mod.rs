//! 镜片通信协议
//!
//! 所有命令字节、固定帧形状都必须与眼镜固件完全一致。
//!
//! | 命令 | 值     | 方向     | 说明                      |
//! |------|--------|----------|---------------------------|
//! | TEXT | `0x4E` | 写 / 通知 | 文本分包，通知中为应答     |
//! | BMP  | `0x15` | 写 / 通知 | 位图数据包                |
//! | CRC  | `0x16` | 写 / 通知 | 位图 CRC-32 校验包         |
//! | END  | `0x20` | 写 / 通知 | 位图传输结束              |
//! | HB   | `0x25` | 写 / 通知 | 心跳，通知中为回显         |
//! | EVT  | `0xF5` | 通知     | 设备事件（触控、佩戴等）    |

pub mod checksum;
pub mod framer;
pub mod notify;

pub use checksum::{checksum, crc32};
pub use framer::{BitmapFramer, FramingError, HeartbeatFrame, TextFramer};
pub use notify::{Notification, decode_notification};

/// 文本命令
pub const CMD_TEXT: u8 = 0x4E;
/// 位图数据包命令
pub const CMD_BITMAP: u8 = 0x15;
/// 位图 CRC 校验命令
pub const CMD_CRC: u8 = 0x16;
/// 位图传输结束命令
pub const CMD_END: u8 = 0x20;
/// 心跳命令
pub const CMD_HEARTBEAT: u8 = 0x25;
/// 设备事件（仅出现在通知中）
pub const CMD_DEVICE_EVENT: u8 = 0xF5;

/// 显示状态: 0x70 (Text Show) | 0x01 (Display new content)
pub const SCREEN_STATUS: u8 = 0x71;

/// 位图写入的目标地址，CRC 计算时会拼在载荷前面
pub const BITMAP_ADDRESS: [u8; 4] = [0x00, 0x1C, 0x00, 0x00];

/// 传输结束帧
pub const END_FRAME: [u8; 3] = [CMD_END, 0x0D, 0x0E];

/// 通知应答中的成功 / 失败标记
pub const RESPONSE_SUCCESS: u8 = 0xC9;
pub const RESPONSE_FAILURE: u8 = 0xCA;

/// 文本帧数字段只有一个字节
pub const MAX_TEXT_FRAMES: usize = 255;

/// 默认文本包体大小
pub const DEFAULT_TEXT_BODY_SIZE: usize = 20;
/// 默认位图包体大小
pub const DEFAULT_BITMAP_BODY_SIZE: usize = 194;
