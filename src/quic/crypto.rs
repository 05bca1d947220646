//! QUIC Initial Packet 密钥派生
//!
//! 参考 RFC 9001 Section 5: Packet Protection
//! 参考 RFC 8446 Section 7.1: HKDF-Expand-Label
//!
//! 反向代理只解析客户端发来的 Initial，所以这里只派生 "client in"
//! 方向的密钥。

use crate::quic::error::{QuicError, Result};
use crate::quic::parser::VERSION_2;
use ring::hkdf::{KeyType, Prk, Salt, HKDF_SHA256};

/// QUIC Version 1 Initial Salt
///
/// RFC 9001 Section 5.2 规定的常量，用于从 DCID 派生初始密钥。
pub const INITIAL_SALT_V1: &[u8] = &[
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// QUIC Version 2 Initial Salt (RFC 9369 Section 3.3.1)
pub const INITIAL_SALT_V2: &[u8] = &[
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d,
    0xcb, 0xf9, 0xbd, 0x2e, 0xd9,
];

/// Initial Packet 的三件套密钥
#[derive(Debug, Clone)]
pub struct InitialKeys {
    /// AEAD 密钥 (16 bytes, AES-128-GCM)
    pub key: Vec<u8>,
    /// 初始化向量 (12 bytes)
    pub iv: Vec<u8>,
    /// Header Protection 密钥 (16 bytes)
    pub hp_key: Vec<u8>,
}

fn label_quic_key(version: u32) -> &'static [u8] {
    if version == VERSION_2 { b"quicv2 key" } else { b"quic key" }
}

fn label_quic_iv(version: u32) -> &'static [u8] {
    if version == VERSION_2 { b"quicv2 iv" } else { b"quic iv" }
}

fn label_quic_hp(version: u32) -> &'static [u8] {
    if version == VERSION_2 { b"quicv2 hp" } else { b"quic hp" }
}

/// 从 DCID 派生客户端方向的 Initial Keys
///
/// 流程 (RFC 9001 Section 5.2):
/// 1. initial_secret = HKDF-Extract(INITIAL_SALT, DCID)
/// 2. client_initial_secret = HKDF-Expand-Label(initial_secret, "client in", "", 32)
/// 3. key = HKDF-Expand-Label(client_initial_secret, "quic key", "", 16)
/// 4. iv = HKDF-Expand-Label(client_initial_secret, "quic iv", "", 12)
/// 5. hp_key = HKDF-Expand-Label(client_initial_secret, "quic hp", "", 16)
pub fn derive_initial_keys(dcid: &[u8], version: u32) -> Result<InitialKeys> {
    let salt_bytes = if version == VERSION_2 {
        INITIAL_SALT_V2
    } else {
        INITIAL_SALT_V1
    };

    let salt = Salt::new(HKDF_SHA256, salt_bytes);
    let initial_secret = salt.extract(dcid);

    let client_secret_bytes = hkdf_expand_label(&initial_secret, b"client in", b"", 32)
        .map_err(|e| QuicError::KeyDerivation(format!("HKDF-Expand 'client in': {:?}", e)))?;
    let client_secret = Prk::new_less_safe(HKDF_SHA256, &client_secret_bytes);

    let key = hkdf_expand_label(&client_secret, label_quic_key(version), b"", 16)
        .map_err(|e| QuicError::KeyDerivation(format!("HKDF-Expand 'quic key': {:?}", e)))?;
    let iv = hkdf_expand_label(&client_secret, label_quic_iv(version), b"", 12)
        .map_err(|e| QuicError::KeyDerivation(format!("HKDF-Expand 'quic iv': {:?}", e)))?;
    let hp_key = hkdf_expand_label(&client_secret, label_quic_hp(version), b"", 16)
        .map_err(|e| QuicError::KeyDerivation(format!("HKDF-Expand 'quic hp': {:?}", e)))?;

    Ok(InitialKeys { key, iv, hp_key })
}

/// HKDF 输出长度的包装 (ring 的 expand 需要 KeyType)
struct OutLen(usize);

impl KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label (RFC 8446 Section 7.1)
///
/// HkdfLabel 序列化格式：
/// [Length (2, BE)][Label Length (1)]["tls13 " + Label][Context Length (1)][Context]
fn hkdf_expand_label(
    secret: &Prk,
    label: &[u8],
    context: &[u8],
    length: usize,
) -> std::result::Result<Vec<u8>, ring::error::Unspecified> {
    let mut hkdf_label = Vec::with_capacity(4 + 6 + label.len() + context.len());
    hkdf_label.extend_from_slice(&(length as u16).to_be_bytes());
    hkdf_label.push((6 + label.len()) as u8);
    hkdf_label.extend_from_slice(b"tls13 ");
    hkdf_label.extend_from_slice(label);
    hkdf_label.push(context.len() as u8);
    hkdf_label.extend_from_slice(context);

    let mut out = vec![0u8; length];
    let info = [hkdf_label.as_slice()];
    secret.expand(&info, OutLen(length))?.fill(&mut out)?;
    Ok(out)
}
