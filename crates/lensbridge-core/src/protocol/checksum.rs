//! CRC-32 (IEEE 802.3, reflected)
//!
//! 与 zip / PNG / 以太网使用的 CRC-32 完全一致：
//! 多项式 `0xEDB88320`，初值全 1，结果取反。

/// 计算 CRC-32 数值
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// 计算 CRC-32，返回大端字节序（CRC 帧中的顺序）
pub fn checksum(bytes: &[u8]) -> [u8; 4] {
    crc32(bytes).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0x0000_0000);
        assert_eq!(crc32(b"a"), 0xE8B7_BE43);
        assert_eq!(
            crc32(b"The quick brown fox jumps over the lazy dog"),
            0x414F_A339
        );
    }

    #[test]
    fn test_checksum_is_big_endian() {
        assert_eq!(checksum(b"123456789"), [0xCB, 0xF4, 0x39, 0x26]);
    }

    #[test]
    fn test_concatenated_input_matches_single_pass() {
        let address = [0x00, 0x1C, 0x00, 0x00];
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut joined = address.to_vec();
        joined.extend_from_slice(&payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&address);
        hasher.update(&payload);
        assert_eq!(crc32(&joined), hasher.finalize());
    }
}
