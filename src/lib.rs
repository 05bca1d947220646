//! hyproxy 库
//!
//! SNI 路由的 QUIC/UDP 反向代理：在不终止加密的前提下解析 QUIC
//! Initial 里的 ClientHello，按主机名把整条连接转发到后端。

pub mod buffer;
pub mod config;
pub mod handler;
pub mod proxy;
pub mod quic;
pub mod session;
pub mod tls;

// 重新导出常用类型
pub use config::Config;
pub use handler::HandlerRegistry;
pub use proxy::{Proxy, ProxyHandle};
