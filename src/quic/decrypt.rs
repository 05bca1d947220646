//! QUIC Initial payload 解密和 ClientHello 提取
//!
//! 参考 RFC 9001 Section 5: Packet Protection
//! 参考 RFC 9000 Section 19.6: CRYPTO Frames
//!
//! 端到端流程：
//! 1. 解析 Initial Header 提取 DCID
//! 2. 从 DCID 派生 client 方向的 Initial Keys
//! 3. 移除 Header Protection
//! 4. AEAD 解密 payload
//! 5. 按 offset 重组 datagram 内的 CRYPTO frames (跨包分片不支持)
//! 6. 解析 TLS ClientHello 提取 SNI / ALPN
//!
//! 解析是纯函数：不保留任何跨 datagram 状态。

use crate::quic::crypto::{derive_initial_keys, InitialKeys};
use crate::quic::error::{QuicError, Result};
use crate::quic::header::remove_header_protection;
use crate::quic::parser::{parse_initial_header, parse_varint};
use crate::tls;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// AES-128-GCM Auth Tag 长度
const TAG_LEN: usize = 16;

/// 路由决策需要的 ClientHello 属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// IDN 解码、小写化后的 SNI
    pub sni: String,
    /// ALPN 协议列表 (可能为空)
    pub alpn: Vec<String>,
}

/// 从一个 UDP datagram 中提取 ClientHello
///
/// datagram 可以是 coalesced 的多个 QUIC packets；只解密最外层的
/// Initial，解密范围受其 Length 字段约束。
///
/// # 返回
/// - `Ok(ClientHello)` — SNI 一定非空 (没有 SNI 时返回 [`QuicError::NoSni`])
pub fn parse_client_hello(datagram: &[u8]) -> Result<ClientHello> {
    let header = parse_initial_header(datagram)?;
    trace!(
        version = header.version,
        dcid_len = header.dcid.len(),
        token_len = header.token_len,
        payload_len = header.payload_len,
        "parsed Initial header"
    );

    let keys = derive_initial_keys(&header.dcid, header.version)?;

    // Length 字段覆盖 PN + 加密 payload；超出部分是 coalesced packet
    let packet_end = header
        .pn_offset
        .checked_add(header.payload_len)
        .ok_or_else(|| QuicError::Decryption("packet length overflow".to_string()))?;
    if datagram.len() < packet_end {
        return Err(QuicError::PacketTooShort {
            expected: packet_end,
            actual: datagram.len(),
        });
    }

    let mut packet = datagram[..packet_end].to_vec();

    let (first_byte, packet_number, pn_len) =
        remove_header_protection(&mut packet, header.pn_offset, &keys)?;

    // Long header 的 reserved bits (bits 3-2) 解保护后必须为 0，
    // 否则多半是密钥方向不对或根本不是 Initial
    if first_byte & 0x0C != 0 {
        return Err(QuicError::HeaderProtection(format!(
            "non-zero reserved bits after unprotection: {:#04x}",
            first_byte
        )));
    }

    let payload = decrypt_payload(&packet, header.pn_offset, pn_len, packet_number, &keys)?;
    debug!(payload_len = payload.len(), pn = packet_number, "Initial payload decrypted");

    let crypto_stream = reassemble_crypto(&payload)?;

    // ClientHello 跨多个 Initial packets 不支持：重组出的 stream
    // 必须覆盖完整的 handshake message
    if let Some(need) = tls::sni::required_len(&crypto_stream) {
        if crypto_stream.len() < need {
            return Err(QuicError::Truncated {
                have: crypto_stream.len(),
                need,
            });
        }
    }

    let hello = tls::parse_client_hello(&crypto_stream)?;
    match hello.sni {
        Some(sni) if !sni.is_empty() => Ok(ClientHello {
            sni,
            alpn: hello.alpn,
        }),
        _ => Err(QuicError::NoSni),
    }
}

/// AEAD 解密 Initial payload
///
/// RFC 9001 Section 5.3: AAD = 移除 header protection 后的完整 header
/// (含 PN)；nonce = IV xor packet_number (big-endian 右对齐)。
fn decrypt_payload(
    packet: &[u8],
    pn_offset: usize,
    pn_len: usize,
    packet_number: u64,
    keys: &InitialKeys,
) -> Result<Vec<u8>> {
    let payload_start = pn_offset + pn_len;
    if packet.len() < payload_start + TAG_LEN {
        return Err(QuicError::Decryption(format!(
            "Encrypted payload too short: {} bytes",
            packet.len().saturating_sub(payload_start)
        )));
    }

    let aad = &packet[..payload_start];
    let nonce = construct_nonce(&keys.iv, packet_number)?;

    let unbound_key = UnboundKey::new(&AES_128_GCM, &keys.key)
        .map_err(|e| QuicError::Decryption(format!("Failed to create AEAD key: {:?}", e)))?;
    let aead_key = LessSafeKey::new(unbound_key);

    let mut in_out = packet[payload_start..].to_vec();
    let plaintext_len = aead_key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|e| QuicError::Decryption(format!("AEAD open failed: {:?}", e)))?
        .len();

    in_out.truncate(plaintext_len);
    Ok(in_out)
}

/// 构造 Nonce: IV xor Packet Number (RFC 9001 Section 5.3)
fn construct_nonce(iv: &[u8], packet_number: u64) -> Result<[u8; 12]> {
    if iv.len() != 12 {
        return Err(QuicError::Decryption(format!(
            "Invalid IV length: {} (expected 12)",
            iv.len()
        )));
    }

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(iv);

    let pn_bytes = packet_number.to_be_bytes();
    for i in 0..8 {
        nonce[4 + i] ^= pn_bytes[i];
    }

    Ok(nonce)
}

/// 遍历解密后的 frames，按 offset 重组 CRYPTO stream
///
/// frame 在同一个 packet 内可以乱序 (RFC 9000 Section 19.6)，
/// 用 BTreeMap 排序后拼接；出现 gap 直接报错——跨包缓存是
/// 有状态的，这个解析器不做。
fn reassemble_crypto(payload: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = payload;
    let mut fragments: BTreeMap<u64, &[u8]> = BTreeMap::new();

    while !cursor.is_empty() {
        let (frame_type, consumed) = parse_varint(cursor)
            .map_err(|e| QuicError::CryptoFrame(format!("Failed to parse frame type: {}", e)))?;
        cursor = &cursor[consumed..];

        match frame_type {
            0x00 => continue, // PADDING
            0x01 => continue, // PING
            0x02 | 0x03 => {
                // ACK: Largest Acknowledged, ACK Delay, ACK Range Count, First ACK Range
                let (_, n) = parse_varint(cursor)
                    .map_err(|e| QuicError::CryptoFrame(format!("ACK largest: {}", e)))?;
                cursor = &cursor[n..];
                let (_, n) = parse_varint(cursor)
                    .map_err(|e| QuicError::CryptoFrame(format!("ACK delay: {}", e)))?;
                cursor = &cursor[n..];
                let (range_count, n) = parse_varint(cursor)
                    .map_err(|e| QuicError::CryptoFrame(format!("ACK range count: {}", e)))?;
                cursor = &cursor[n..];
                let (_, n) = parse_varint(cursor)
                    .map_err(|e| QuicError::CryptoFrame(format!("ACK first range: {}", e)))?;
                cursor = &cursor[n..];
                for _ in 0..range_count {
                    let (_, n) = parse_varint(cursor)
                        .map_err(|e| QuicError::CryptoFrame(format!("ACK gap: {}", e)))?;
                    cursor = &cursor[n..];
                    let (_, n) = parse_varint(cursor)
                        .map_err(|e| QuicError::CryptoFrame(format!("ACK range len: {}", e)))?;
                    cursor = &cursor[n..];
                }
                if frame_type == 0x03 {
                    // ECN counts
                    for _ in 0..3 {
                        let (_, n) = parse_varint(cursor)
                            .map_err(|e| QuicError::CryptoFrame(format!("ACK ECN: {}", e)))?;
                        cursor = &cursor[n..];
                    }
                }
            }
            0x06 => {
                // CRYPTO: Offset (varint) + Length (varint) + Data
                let (offset, n) = parse_varint(cursor)
                    .map_err(|e| QuicError::CryptoFrame(format!("CRYPTO offset: {}", e)))?;
                cursor = &cursor[n..];
                let (length, n) = parse_varint(cursor)
                    .map_err(|e| QuicError::CryptoFrame(format!("CRYPTO length: {}", e)))?;
                cursor = &cursor[n..];

                let length = length as usize;
                if cursor.len() < length {
                    return Err(QuicError::CryptoFrame(format!(
                        "CRYPTO data truncated: expected {}, got {}",
                        length,
                        cursor.len()
                    )));
                }
                fragments.insert(offset, &cursor[..length]);
                cursor = &cursor[length..];
            }
            other => {
                // Initial packet 里只关心 CRYPTO；遇到陌生类型停止
                debug!(frame_type = other, "stopping frame walk");
                break;
            }
        }
    }

    if fragments.is_empty() {
        return Err(QuicError::CryptoFrame("No CRYPTO frame found".to_string()));
    }

    // 从 offset 0 开始拼接连续的分片
    let mut stream = Vec::new();
    let mut next: u64 = 0;
    for (offset, data) in fragments {
        if offset > next {
            return Err(QuicError::CryptoFrame(format!(
                "gap in CRYPTO stream at offset {} (expected {})",
                offset, next
            )));
        }
        let skip = (next - offset) as usize;
        if skip < data.len() {
            stream.extend_from_slice(&data[skip..]);
            next += (data.len() - skip) as u64;
        }
    }

    Ok(stream)
}
