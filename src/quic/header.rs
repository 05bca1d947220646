//! QUIC Header Protection 移除和 Packet Number 解码
//!
//! 参考 RFC 9001 Section 5.4: Header Protection
//! 参考 RFC 9000 Section 17.1: Packet Number Encoding and Decoding

use crate::quic::crypto::InitialKeys;
use crate::quic::error::{QuicError, Result};
use ring::aead::quic::{HeaderProtectionKey, AES_128};

/// 移除 QUIC Initial Packet 的 Header Protection
///
/// RFC 9001 Section 5.4.2: sample 从 packet number 字段起始后第 4 个
/// 字节开始，取 16 字节。
///
/// # 参数
/// - `packet`: 完整的 QUIC Initial Packet (first byte 和 PN 会被 in-place 解密)
/// - `pn_offset`: Packet Number 在 packet 中的偏移量
/// - `keys`: Initial Keys
///
/// # 返回
/// - (unprotected_first_byte, packet_number, pn_len)
pub fn remove_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    keys: &InitialKeys,
) -> Result<(u8, u64, usize)> {
    let sample_start = pn_offset + 4;
    let sample_end = sample_start + 16;

    if packet.len() < sample_end {
        return Err(QuicError::PacketTooShort {
            expected: sample_end,
            actual: packet.len(),
        });
    }

    let hp_key = HeaderProtectionKey::new(&AES_128, &keys.hp_key)
        .map_err(|e| QuicError::HeaderProtection(format!("Failed to create HP key: {:?}", e)))?;

    let sample = &packet[sample_start..sample_end];
    let mask = hp_key
        .new_mask(sample)
        .map_err(|e| QuicError::HeaderProtection(format!("Failed to generate mask: {:?}", e)))?;

    // Long header: first byte 只有低 4 bits 受保护
    let unprotected_first_byte = packet[0] ^ (mask[0] & 0x0F);
    let pn_len = (unprotected_first_byte & 0x03) as usize + 1;

    // PN 字段 in-place 解密
    let mut pn_bytes = [0u8; 4];
    for i in 0..pn_len {
        pn_bytes[i] = packet[pn_offset + i] ^ mask[1 + i];
        packet[pn_offset + i] = pn_bytes[i];
    }
    packet[0] = unprotected_first_byte;

    // 第一个 Initial 的期望 PN 是 0
    let packet_number = decode_packet_number(&pn_bytes[..pn_len], 0)?;

    Ok((unprotected_first_byte, packet_number, pn_len))
}

/// 解码截断的 Packet Number (RFC 9000 Section 17.1 / Appendix A)
///
/// ```text
/// pn_win = 1 << (8 * pn_len)
/// pn_hwin = pn_win / 2
/// candidate = (expected_pn & !(pn_win - 1)) | truncated_pn
/// 选择与 expected_pn 距离最近的候选值
/// ```
pub fn decode_packet_number(truncated_pn: &[u8], expected_pn: u64) -> Result<u64> {
    let pn_len = truncated_pn.len();
    if pn_len == 0 || pn_len > 4 {
        return Err(QuicError::PacketNumber(format!(
            "Invalid PN length: {}",
            pn_len
        )));
    }

    let mut truncated = 0u64;
    for &byte in truncated_pn {
        truncated = (truncated << 8) | byte as u64;
    }

    let pn_win = 1u64 << (8 * pn_len as u64);
    let pn_hwin = pn_win / 2;
    let mask = pn_win - 1;

    let candidate = (expected_pn & !mask) | truncated;

    let decoded = if candidate <= expected_pn + pn_hwin && candidate + pn_win > expected_pn + pn_hwin
    {
        candidate
    } else if candidate > expected_pn + pn_hwin {
        candidate.saturating_sub(pn_win)
    } else {
        candidate + pn_win
    };

    Ok(decoded)
}
