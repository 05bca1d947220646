//! QUIC Initial Packet 解析模块
//!
//! 本模块提供代理做路由决策所需的全部 QUIC 解析：
//!
//! # 架构
//!
//! - [`parser`]: Header 解析 (Initial long header / 短头部 DCID / SCID 学习)
//! - [`crypto`]: Initial Keys 派生 (HKDF)
//! - [`header`]: Header Protection 移除和 Packet Number 解码
//! - [`decrypt`]: Payload 解密 + CRYPTO frame 重组 + ClientHello 提取
//! - [`error`]: 错误类型定义
//!
//! # 限制
//!
//! - 不支持 ECH (Encrypted ClientHello)
//! - 仅支持 QUIC v1 (RFC 9001) 和 v2 (RFC 9369)
//! - 无状态解析：ClientHello 跨多个 Initial packets 时放弃
//!   (重组只在单个 datagram 内进行)

pub mod crypto;
pub mod decrypt;
pub mod error;
pub mod header;
pub mod parser;

pub use crypto::{derive_initial_keys, InitialKeys};
pub use decrypt::{parse_client_hello, ClientHello};
pub use error::{QuicError, Result};
pub use header::{decode_packet_number, remove_header_protection};
pub use parser::{
    extract_long_header_scid, extract_short_header_dcid, parse_initial_header, InitialHeader,
};
