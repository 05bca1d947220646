//! 静态路由：所有连接发往固定后端，多个后端时轮询
//!
//! 配置 `backend` (单个) 或 `backends` (列表)，二者互斥；
//! 都没有时退回环境变量 `HYPROXY_BACKEND`。

use crate::handler::{Context, Handler, Verdict};
use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 环境变量形式的后端回退
pub const BACKEND_ENV: &str = "HYPROXY_BACKEND";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimpleRouterConfig {
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    backends: Option<Vec<String>>,
}

pub struct SimpleRouter {
    backends: Vec<String>,
    counter: AtomicU64,
}

pub fn factory(config: Option<&serde_json::Value>) -> Result<Arc<dyn Handler>> {
    let cfg: SimpleRouterConfig = match config {
        Some(value) => serde_json::from_value(value.clone())
            .context("invalid simple-router config")?,
        None => SimpleRouterConfig::default(),
    };

    let backends = match (cfg.backend, cfg.backends) {
        (Some(_), Some(_)) => {
            bail!("simple-router: 'backend' and 'backends' are mutually exclusive")
        }
        (Some(single), None) if !single.is_empty() => vec![single],
        (None, Some(list)) if !list.is_empty() => {
            if list.iter().any(|b| b.is_empty()) {
                bail!("simple-router: empty backend address in 'backends'");
            }
            list
        }
        _ => match std::env::var(BACKEND_ENV) {
            Ok(env) if !env.is_empty() => vec![env],
            _ => bail!(
                "simple-router requires 'backend', 'backends' config or {} env",
                BACKEND_ENV
            ),
        },
    };

    Ok(Arc::new(SimpleRouter {
        backends,
        counter: AtomicU64::new(0),
    }))
}

#[async_trait]
impl Handler for SimpleRouter {
    fn name(&self) -> &'static str {
        "simple-router"
    }

    async fn on_connect(&self, ctx: &mut Context) -> Verdict {
        // fetch_add 回绕时取模依然均匀
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        let backend = &self.backends[(idx % self.backends.len() as u64) as usize];
        ctx.backend = Some(backend.clone());
        Verdict::Continue
    }
}
