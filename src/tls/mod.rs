//! TLS ClientHello 解析
//!
//! 只做提取 SNI / ALPN 需要的最小解析，不做任何握手。

pub mod sni;

pub use sni::{normalize_hostname, parse_client_hello, ParsedHello, TlsError};
