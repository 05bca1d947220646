//! TLS 1.3 ClientHello 解析：SNI + ALPN 提取
//!
//! 输入是 QUIC CRYPTO stream 重组后的原始 TLS Handshake 字节
//! (开头 0x01 = ClientHello)，不含 TCP 场景的 record layer。

use thiserror::Error;

/// ClientHello 解析错误
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Data too short")]
    DataTooShort,
    #[error("Not a ClientHello (handshake type {0:#04x})")]
    NotClientHello(u8),
    #[error("Invalid extension block")]
    InvalidExtension,
    #[error("Invalid hostname")]
    InvalidHostname,
}

type Result<T> = std::result::Result<T, TlsError>;

/// ClientHello 里与路由相关的字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHello {
    /// IDN 解码并转小写后的主机名；没有 SNI 扩展时为 None
    pub sni: Option<String>,
    /// ALPN 协议列表 (可能为空)
    pub alpn: Vec<String>,
}

/// 需要完整 handshake message 的总长度 (头 4 字节 + body)
///
/// 重组后的 CRYPTO stream 比这个值短说明 ClientHello 跨了多个
/// Initial packets，调用方按截断处理。
pub fn required_len(data: &[u8]) -> Option<usize> {
    if data.len() < 4 || data[0] != 0x01 {
        return None;
    }
    let hs_len = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | (data[3] as usize);
    Some(4 + hs_len)
}

/// 解析 TLS ClientHello，提取 server_name (ext 0) 和 ALPN (ext 16)
pub fn parse_client_hello(data: &[u8]) -> Result<ParsedHello> {
    if data.len() < 4 {
        return Err(TlsError::DataTooShort);
    }

    // TLS Handshake: [msg_type(1)][len(3)][body...]
    if data[0] != 0x01 {
        return Err(TlsError::NotClientHello(data[0]));
    }

    let hs_len = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | (data[3] as usize);
    if data.len() < 4 + hs_len {
        return Err(TlsError::DataTooShort);
    }

    let hello = &data[4..4 + hs_len];

    // legacy_version (2) + random (32)
    if hello.len() < 34 {
        return Err(TlsError::DataTooShort);
    }
    let mut offset = 34;

    // legacy_session_id
    if offset >= hello.len() {
        return Err(TlsError::DataTooShort);
    }
    let session_id_len = hello[offset] as usize;
    offset += 1 + session_id_len;

    // cipher_suites
    if offset + 2 > hello.len() {
        return Err(TlsError::DataTooShort);
    }
    let cipher_suites_len = u16::from_be_bytes([hello[offset], hello[offset + 1]]) as usize;
    offset += 2 + cipher_suites_len;

    // legacy_compression_methods
    if offset >= hello.len() {
        return Err(TlsError::DataTooShort);
    }
    let compression_len = hello[offset] as usize;
    offset += 1 + compression_len;

    // extensions
    if offset + 2 > hello.len() {
        // 没有扩展块的 ClientHello (TLS 1.2 以前允许)
        return Ok(ParsedHello { sni: None, alpn: Vec::new() });
    }
    let extensions_len = u16::from_be_bytes([hello[offset], hello[offset + 1]]) as usize;
    offset += 2;

    if offset + extensions_len > hello.len() {
        return Err(TlsError::InvalidExtension);
    }
    let ext_end = offset + extensions_len;

    let mut sni = None;
    let mut alpn = Vec::new();

    while offset + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([hello[offset], hello[offset + 1]]);
        let ext_len = u16::from_be_bytes([hello[offset + 2], hello[offset + 3]]) as usize;
        offset += 4;

        if offset + ext_len > ext_end {
            return Err(TlsError::InvalidExtension);
        }
        let ext_data = &hello[offset..offset + ext_len];
        offset += ext_len;

        match ext_type {
            0x0000 => sni = Some(parse_sni_extension(ext_data)?),
            0x0010 => alpn = parse_alpn_extension(ext_data)?,
            _ => {}
        }
    }

    Ok(ParsedHello { sni, alpn })
}

/// server_name 扩展 (RFC 6066 Section 3)
///
/// [list_len(2)][name_type(1)=0][name_len(2)][host_name...]
fn parse_sni_extension(data: &[u8]) -> Result<String> {
    if data.len() < 2 {
        return Err(TlsError::InvalidExtension);
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return Err(TlsError::InvalidExtension);
    }

    let mut offset = 2;
    if offset + 3 > data.len() {
        return Err(TlsError::InvalidExtension);
    }

    let name_type = data[offset];
    offset += 1;
    if name_type != 0x00 {
        return Err(TlsError::InvalidHostname);
    }

    let name_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
    offset += 2;
    if offset + name_len > data.len() {
        return Err(TlsError::InvalidExtension);
    }

    let hostname = std::str::from_utf8(&data[offset..offset + name_len])
        .map_err(|_| TlsError::InvalidHostname)?;

    if !is_valid_hostname(hostname) {
        return Err(TlsError::InvalidHostname);
    }

    Ok(normalize_hostname(hostname))
}

/// application_layer_protocol_negotiation 扩展 (RFC 7301 Section 3.1)
///
/// [list_len(2)] 然后若干 [proto_len(1)][proto...]
fn parse_alpn_extension(data: &[u8]) -> Result<Vec<String>> {
    if data.len() < 2 {
        return Err(TlsError::InvalidExtension);
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return Err(TlsError::InvalidExtension);
    }

    let mut protocols = Vec::new();
    let mut offset = 2;
    let list_end = 2 + list_len;

    while offset < list_end {
        let proto_len = data[offset] as usize;
        offset += 1;
        if proto_len == 0 || offset + proto_len > list_end {
            return Err(TlsError::InvalidExtension);
        }
        let proto = String::from_utf8_lossy(&data[offset..offset + proto_len]).into_owned();
        protocols.push(proto);
        offset += proto_len;
    }

    Ok(protocols)
}

/// 主机名归一化：IDN (punycode) 解码 + 转小写
///
/// 路由表的 key 在启动时用同一函数归一化，保证查找一致。
pub fn normalize_hostname(hostname: &str) -> String {
    let (decoded, result) = idna::domain_to_unicode(hostname);
    if result.is_ok() && !decoded.is_empty() {
        decoded.to_lowercase()
    } else {
        hostname.to_ascii_lowercase()
    }
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
}
