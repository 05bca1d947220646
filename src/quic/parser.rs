//! QUIC Packet Header 解析器
//!
//! 参考 RFC 9000 Section 17: Packet Formats
//!
//! 这里只解析到转发决策需要的程度：
//! - Initial packet 的完整 long header (ClientHello 提取的前置步骤)
//! - 任意 long header 的 SCID (学习后端选择的 Connection ID)
//! - 短头部的 DCID 前缀 (按配置的 CID 长度截取，用于会话查找)

use crate::quic::error::{QuicError, Result};
use bytes::Bytes;

/// QUIC v1
pub const VERSION_1: u32 = 0x0000_0001;
/// QUIC v2 (RFC 9369)
pub const VERSION_2: u32 = 0x6b33_43cf;

/// Connection ID 的最大长度 (RFC 9000 Section 17.2)
pub const MAX_CID_LEN: usize = 20;

/// QUIC Initial Packet Header 结构
#[derive(Debug, Clone)]
pub struct InitialHeader {
    /// 第一个字节 (包含 Packet Type 和受保护的 Packet Number Length)
    pub first_byte: u8,
    /// QUIC 版本号
    pub version: u32,
    /// Destination Connection ID (用于密钥派生)
    pub dcid: Bytes,
    /// Source Connection ID
    pub scid: Bytes,
    /// Token 长度
    pub token_len: usize,
    /// Length 字段的值 (Packet Number + 加密 payload 的总长度)
    pub payload_len: usize,
    /// Packet Number 在数据包中的偏移量
    pub pn_offset: usize,
}

/// 解析 QUIC Initial Packet 的 long header
///
/// # 参数
/// - `packet`: 完整的 UDP payload (可能是 coalesced datagram，只看第一个 packet)
///
/// # 返回
/// - 包含所有关键字段的 [`InitialHeader`]
pub fn parse_initial_header(packet: &[u8]) -> Result<InitialHeader> {
    if packet.is_empty() {
        return Err(QuicError::PacketTooShort {
            expected: 1,
            actual: 0,
        });
    }

    let first_byte = packet[0];

    // Long Header: bit 7 = 1
    if (first_byte & 0x80) == 0 {
        return Err(QuicError::NotInitial(first_byte));
    }

    if packet.len() < 6 {
        return Err(QuicError::PacketTooShort {
            expected: 6,
            actual: packet.len(),
        });
    }

    let version = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);

    // Long Header packet type 在 bits 5-4。
    // v1: 0b00 = Initial; v2 把类型编码整体循环了一位，Initial = 0b01。
    let packet_type = (first_byte & 0x30) >> 4;
    let initial_type = match version {
        VERSION_1 => 0b00,
        VERSION_2 => 0b01,
        _ => return Err(QuicError::UnsupportedVersion { version }),
    };
    if packet_type != initial_type {
        return Err(QuicError::NotInitial(first_byte));
    }

    let mut offset = 5;

    // DCID Length + DCID
    let dcil = packet[offset] as usize;
    offset += 1;
    if dcil > MAX_CID_LEN {
        return Err(QuicError::VarInt(format!("DCID length {} > {}", dcil, MAX_CID_LEN)));
    }
    if packet.len() < offset + dcil {
        return Err(QuicError::PacketTooShort {
            expected: offset + dcil,
            actual: packet.len(),
        });
    }
    let dcid = Bytes::copy_from_slice(&packet[offset..offset + dcil]);
    offset += dcil;

    // SCID Length + SCID
    if packet.len() < offset + 1 {
        return Err(QuicError::PacketTooShort {
            expected: offset + 1,
            actual: packet.len(),
        });
    }
    let scil = packet[offset] as usize;
    offset += 1;
    if scil > MAX_CID_LEN {
        return Err(QuicError::VarInt(format!("SCID length {} > {}", scil, MAX_CID_LEN)));
    }
    if packet.len() < offset + scil {
        return Err(QuicError::PacketTooShort {
            expected: offset + scil,
            actual: packet.len(),
        });
    }
    let scid = Bytes::copy_from_slice(&packet[offset..offset + scil]);
    offset += scil;

    // Token Length (VarInt) + Token
    let (token_len, consumed) =
        parse_varint(&packet[offset..]).map_err(QuicError::VarInt)?;
    offset += consumed;
    let token_len = token_len as usize;

    if packet.len() < offset + token_len {
        return Err(QuicError::PacketTooShort {
            expected: offset + token_len,
            actual: packet.len(),
        });
    }
    offset += token_len;

    // Length (VarInt)，覆盖 Packet Number + 加密 payload
    let (payload_len, consumed) =
        parse_varint(&packet[offset..]).map_err(QuicError::VarInt)?;
    offset += consumed;

    Ok(InitialHeader {
        first_byte,
        version,
        dcid,
        scid,
        token_len,
        payload_len: payload_len as usize,
        pn_offset: offset,
    })
}

/// 从任意 long header packet 中提取 SCID
///
/// 后端→客户端方向的 pump 用它学习服务端选择的 Connection ID。
/// 不校验 packet type (Initial / Handshake / Retry 都携带 SCID)，
/// 也不校验版本——只要结构上是 long header 就取。
/// 短头部或结构不完整时返回 `None`。
pub fn extract_long_header_scid(datagram: &[u8]) -> Option<Bytes> {
    if datagram.len() < 7 || (datagram[0] & 0x80) == 0 {
        return None;
    }

    let mut offset = 5;

    let dcil = datagram[offset] as usize;
    offset += 1;
    if dcil > MAX_CID_LEN || datagram.len() < offset + dcil + 1 {
        return None;
    }
    offset += dcil;

    let scil = datagram[offset] as usize;
    offset += 1;
    if scil == 0 || scil > MAX_CID_LEN || datagram.len() < offset + scil {
        return None;
    }

    Some(Bytes::copy_from_slice(&datagram[offset..offset + scil]))
}

/// 从短头部 packet 中按固定长度截取 DCID
///
/// 短头部不携带 CID 长度，只有监听端知道自己发出的 CID 多长
/// (RFC 9000 Section 17.3)。代理观察的是后端选择的 CID，长度由
/// 配置的 `cid_length` 给出。
pub fn extract_short_header_dcid(datagram: &[u8], cid_len: usize) -> Option<&[u8]> {
    if (datagram.first()? & 0x80) != 0 {
        return None; // long header
    }
    if datagram.len() < 1 + cid_len {
        return None;
    }
    Some(&datagram[1..1 + cid_len])
}

/// 解析 QUIC VarInt (RFC 9000 Section 16)
///
/// # 返回
/// - (value, bytes_consumed)
pub fn parse_varint(data: &[u8]) -> std::result::Result<(u64, usize), String> {
    if data.is_empty() {
        return Err("No data for VarInt".to_string());
    }

    let first = data[0];
    let prefix = (first & 0xC0) >> 6;
    let length = 1usize << prefix; // 1, 2, 4, or 8 bytes

    if data.len() < length {
        return Err(format!(
            "VarInt truncated: expected {} bytes, got {}",
            length,
            data.len()
        ));
    }

    let mut value = (first & 0x3F) as u64;
    for &b in &data[1..length] {
        value = (value << 8) | b as u64;
    }

    Ok((value, length))
}
