//! QUIC Initial 解析错误类型
use thiserror::Error;

/// ClientHello 提取过程中可能出现的错误
///
/// 代理对所有解析失败的处理是一样的 (debug 日志 + 丢弃该 datagram)，
/// 区分类型主要用于日志和测试断言。
#[derive(Error, Debug)]
pub enum QuicError {
    /// 数据包太短，无法解析
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// 不是 QUIC Initial Packet (短头部或其他 long header 类型)
    #[error("Not a QUIC Initial packet (first byte: {0:#04x})")]
    NotInitial(u8),

    /// 不支持的 QUIC 版本
    #[error("Unsupported QUIC version: {version:#010x}")]
    UnsupportedVersion { version: u32 },

    /// VarInt 解码失败
    #[error("VarInt decoding failed: {0}")]
    VarInt(String),

    /// 密钥派生失败
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Header Protection 移除失败
    #[error("Header protection removal failed: {0}")]
    HeaderProtection(String),

    /// Packet Number 解码失败
    #[error("Packet number decoding failed: {0}")]
    PacketNumber(String),

    /// 解密失败
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// CRYPTO Frame 解析失败
    #[error("CRYPTO frame parsing failed: {0}")]
    CryptoFrame(String),

    /// CRYPTO stream 不完整 (ClientHello 跨多个 Initial packets，不支持)
    #[error("Truncated CRYPTO stream: have {have} bytes, handshake needs {need}")]
    Truncated { have: usize, need: usize },

    /// TLS ClientHello 解析失败
    #[error("TLS ClientHello parsing failed: {0}")]
    Tls(#[from] crate::tls::TlsError),

    /// ClientHello 中没有 SNI (或为空)
    #[error("No SNI found in ClientHello")]
    NoSni,
}

pub type Result<T> = std::result::Result<T, QuicError>;
