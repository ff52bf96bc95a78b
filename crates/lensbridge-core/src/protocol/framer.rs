//! 分包器
//!
//! 把一段逻辑载荷切成链路大小的帧，并加上对应命令族的包头。
//! 这里只负责生成字节，不做任何 I/O；发送和节流由 [`crate::link::LinkSession`] 完成。
//!
//! # 文本帧
//!
//! ```text
//! ┌──────┬─────┬───────┬───────┬────────┬──────────┬──────┬──────────┐
//! │ 0x4E │ tag │ total │ index │ status │ 00 00 00 │ 0x01 │ body ... │
//! └──────┴─────┴───────┴───────┴────────┴──────────┴──────┴──────────┘
//! ```
//!
//! # 位图帧
//!
//! ```text
//! 首帧:  [0x15, seq, addr0, addr1, addr2, addr3, body ...]
//! 后续:  [0x15, seq, body ...]
//! 校验:  [0x16, crc0, crc1, crc2, crc3]
//! 结束:  [0x20, 0x0D, 0x0E]
//! ```

use super::{
    BITMAP_ADDRESS, CMD_BITMAP, CMD_CRC, CMD_HEARTBEAT, CMD_TEXT, END_FRAME, MAX_TEXT_FRAMES,
    SCREEN_STATUS, checksum,
};

/// 文本帧包头长度
pub const TEXT_HEADER_LEN: usize = 9;
/// 心跳帧长度
pub const HEARTBEAT_LEN: usize = 6;

/// 分包错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Payload too large: needs {frames} frames, at most {max} allowed")]
    PayloadTooLarge { frames: usize, max: usize },

    #[error("Frame body size must be non-zero")]
    ZeroBodySize,
}

/// 文本命令族分包器
#[derive(Debug, Clone, Copy)]
pub struct TextFramer {
    body_size: usize,
}

impl TextFramer {
    pub fn new(body_size: usize) -> Result<Self, FramingError> {
        if body_size == 0 {
            return Err(FramingError::ZeroBodySize);
        }
        Ok(Self { body_size })
    }

    pub fn body_size(&self) -> usize {
        self.body_size
    }

    /// `ceil(len / body_size)`
    pub fn frame_count(&self, len: usize) -> usize {
        len.div_ceil(self.body_size)
    }

    /// 使用随机操作标签分包
    ///
    /// 标签只用于让眼镜把同一条消息的各帧关联起来，不保证跨操作唯一。
    pub fn frames(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        self.frames_with_tag(bytes, rand::random::<u8>())
    }

    /// 使用指定操作标签分包
    pub fn frames_with_tag(&self, bytes: &[u8], tag: u8) -> Result<Vec<Vec<u8>>, FramingError> {
        let total = self.frame_count(bytes.len());
        if total > MAX_TEXT_FRAMES {
            return Err(FramingError::PayloadTooLarge {
                frames: total,
                max: MAX_TEXT_FRAMES,
            });
        }

        let frames = bytes
            .chunks(self.body_size)
            .enumerate()
            .map(|(index, body)| {
                let mut frame = Vec::with_capacity(TEXT_HEADER_LEN + body.len());
                // total 和 index 都已确认不超过 255
                frame.extend_from_slice(&[
                    CMD_TEXT,
                    tag,
                    total as u8,
                    index as u8,
                    SCREEN_STATUS,
                    0x00,
                    0x00,
                    0x00,
                    0x01,
                ]);
                frame.extend_from_slice(body);
                frame
            })
            .collect();

        Ok(frames)
    }
}

/// 位图命令族分包器
#[derive(Debug, Clone, Copy)]
pub struct BitmapFramer {
    body_size: usize,
    address: [u8; 4],
}

impl BitmapFramer {
    pub fn new(body_size: usize) -> Result<Self, FramingError> {
        Self::with_address(body_size, BITMAP_ADDRESS)
    }

    pub fn with_address(body_size: usize, address: [u8; 4]) -> Result<Self, FramingError> {
        if body_size == 0 {
            return Err(FramingError::ZeroBodySize);
        }
        Ok(Self { body_size, address })
    }

    pub fn body_size(&self) -> usize {
        self.body_size
    }

    pub fn address(&self) -> [u8; 4] {
        self.address
    }

    /// 数据帧 + CRC 帧 + 结束帧，按发送顺序排列
    pub fn frames(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = self.data_frames(bytes);
        frames.push(self.crc_frame(bytes).to_vec());
        frames.push(END_FRAME.to_vec());
        frames
    }

    /// 数据帧，序号从 0 开始按 256 取模递增；只有首帧携带地址
    pub fn data_frames(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut seq: u8 = 0;
        bytes
            .chunks(self.body_size)
            .enumerate()
            .map(|(index, body)| {
                let mut frame = Vec::with_capacity(6 + body.len());
                frame.push(CMD_BITMAP);
                frame.push(seq);
                if index == 0 {
                    frame.extend_from_slice(&self.address);
                }
                frame.extend_from_slice(body);
                seq = seq.wrapping_add(1);
                frame
            })
            .collect()
    }

    /// CRC 帧，校验范围是 `address ++ 完整载荷`
    pub fn crc_frame(&self, bytes: &[u8]) -> [u8; 5] {
        let mut covered = Vec::with_capacity(self.address.len() + bytes.len());
        covered.extend_from_slice(&self.address);
        covered.extend_from_slice(bytes);
        let crc = checksum(&covered);
        [CMD_CRC, crc[0], crc[1], crc[2], crc[3]]
    }
}

/// 心跳帧: `[0x25, len_lo, len_hi, seq, 0x04, seq]`
pub struct HeartbeatFrame;

impl HeartbeatFrame {
    pub fn build(seq: u8) -> [u8; HEARTBEAT_LEN] {
        let len = (HEARTBEAT_LEN as u16).to_le_bytes();
        [CMD_HEARTBEAT, len[0], len[1], seq, 0x04, seq]
    }
}
