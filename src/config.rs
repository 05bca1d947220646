//! 配置文档 (JSON)
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:5520",
//!   "session_timeout": 600,
//!   "handlers": [
//!     { "type": "sni-router", "config": { "routes": { "a.com": "b:443" } } },
//!     { "type": "forwarder" }
//!   ]
//! }
//! ```
//!
//! `listen` 缺省时回退到环境变量 `HYPROXY_LISTEN`，再缺省用 `:5520`。
//! handler 的配置块原样保留为 JSON 值，由各自的工厂解析。

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

/// 监听地址的环境变量回退
pub const LISTEN_ENV: &str = "HYPROXY_LISTEN";
/// 最终的监听缺省值
pub const DEFAULT_LISTEN: &str = ":5520";

/// 会话空闲超时缺省 (秒)
fn default_session_timeout() -> u64 {
    600
}

/// 短头部 DCID 的截取长度缺省 (字节)
fn default_cid_length() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// 监听地址 ("host:port" 或 ":port")
    #[serde(default)]
    pub listen: Option<String>,
    /// 会话空闲超时 (秒)；0 是测试模式：立即清扫所有会话
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    /// 短头部包里 DCID 的长度 (监听端观察到的后端 CID 长度)
    #[serde(default = "default_cid_length")]
    pub cid_length: usize,
    /// handler 链，按顺序执行
    pub handlers: Vec<HandlerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl Config {
    /// 从文件加载并做结构校验
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.handlers.is_empty() {
            bail!("'handlers' must not be empty");
        }
        if self.cid_length == 0 || self.cid_length > crate::quic::parser::MAX_CID_LEN {
            bail!(
                "'cid_length' must be in 1..={}, got {}",
                crate::quic::parser::MAX_CID_LEN,
                self.cid_length
            );
        }
        Ok(())
    }

    /// 解析出实际要 bind 的地址
    ///
    /// 优先级：配置文件 → `HYPROXY_LISTEN` → `:5520`。
    /// ":5520" 这种省略主机的写法按 "0.0.0.0:5520" 处理。
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let listen = match &self.listen {
            Some(l) if !l.is_empty() => l.clone(),
            _ => match std::env::var(LISTEN_ENV) {
                Ok(env) if !env.is_empty() => env,
                _ => DEFAULT_LISTEN.to_string(),
            },
        };
        resolve_listen(&listen)
    }
}

fn resolve_listen(listen: &str) -> Result<SocketAddr> {
    let normalized = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    normalized
        .to_socket_addrs()
        .with_context(|| format!("invalid listen address: {}", listen))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("listen address '{}' resolved to nothing", listen))
}
