//! 全局并发会话上限
//!
//! 只做门禁：读代理主循环在派发前填入的会话数，超限就丢。
//! 计数本身归代理所有，这个 handler 不增不减。

use crate::handler::{Context, Handler, Verdict};
use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitConfig {
    max_parallel_connections: i64,
}

pub struct RateLimitGlobal {
    max_parallel_connections: usize,
}

pub fn factory(config: Option<&serde_json::Value>) -> Result<Arc<dyn Handler>> {
    let cfg: RateLimitConfig = match config {
        Some(value) => {
            serde_json::from_value(value.clone()).context("invalid ratelimit-global config")?
        }
        None => bail!("ratelimit-global requires 'max_parallel_connections' config"),
    };

    if cfg.max_parallel_connections <= 0 {
        bail!("ratelimit-global requires 'max_parallel_connections' > 0");
    }

    Ok(Arc::new(RateLimitGlobal {
        max_parallel_connections: cfg.max_parallel_connections as usize,
    }))
}

#[async_trait]
impl Handler for RateLimitGlobal {
    fn name(&self) -> &'static str {
        "ratelimit-global"
    }

    async fn on_connect(&self, ctx: &mut Context) -> Verdict {
        if ctx.session_count >= self.max_parallel_connections {
            return Verdict::drop_with(anyhow!(
                "max connections exceeded ({}/{})",
                ctx.session_count,
                self.max_parallel_connections
            ));
        }
        Verdict::Continue
    }
}
