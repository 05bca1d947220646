//! SNI 路由：按 ClientHello 里的主机名选后端
//!
//! 配置 `routes: { sni → 后端 或 [后端列表] }`。轮询计数器是
//! 每条路由一个，不是全局的。未知 SNI 直接丢弃连接。

use crate::handler::{Context, Handler, Verdict};
use crate::tls::normalize_hostname;
use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SniRouterConfig {
    routes: HashMap<String, BackendSpec>,
}

/// 后端既可以写成单个字符串也可以写成列表
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BackendSpec {
    One(String),
    Many(Vec<String>),
}

/// 一条路由：后端列表 + 自己的轮询计数器
struct Route {
    backends: Vec<String>,
    counter: AtomicU64,
}

impl Route {
    fn next(&self) -> &str {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        &self.backends[(idx % self.backends.len() as u64) as usize]
    }
}

pub struct SniRouter {
    routes: HashMap<String, Route>,
}

pub fn factory(config: Option<&serde_json::Value>) -> Result<Arc<dyn Handler>> {
    let cfg: SniRouterConfig = match config {
        Some(value) => {
            serde_json::from_value(value.clone()).context("invalid sni-router config")?
        }
        None => bail!("sni-router requires 'routes' config"),
    };

    if cfg.routes.is_empty() {
        bail!("sni-router requires a non-empty 'routes' map");
    }

    let mut routes = HashMap::with_capacity(cfg.routes.len());
    for (sni, spec) in cfg.routes {
        let backends = match spec {
            BackendSpec::One(b) => vec![b],
            BackendSpec::Many(list) => list,
        };
        if backends.is_empty() || backends.iter().any(|b| b.is_empty()) {
            bail!("sni-router: empty backends for SNI {}", sni);
        }
        // 路由键与 SNI 提取走同一套归一化，保证查得到
        let key = normalize_hostname(&sni);
        if routes
            .insert(
                key,
                Route {
                    backends,
                    counter: AtomicU64::new(0),
                },
            )
            .is_some()
        {
            bail!("sni-router: duplicate route for SNI {}", sni);
        }
    }

    Ok(Arc::new(SniRouter { routes }))
}

#[async_trait]
impl Handler for SniRouter {
    fn name(&self) -> &'static str {
        "sni-router"
    }

    async fn on_connect(&self, ctx: &mut Context) -> Verdict {
        let hello = match &ctx.hello {
            Some(hello) => hello,
            None => return Verdict::drop_with(anyhow!("no ClientHello")),
        };
        if hello.sni.is_empty() {
            return Verdict::drop_with(anyhow!("no SNI"));
        }

        match self.routes.get(&hello.sni) {
            Some(route) => {
                ctx.backend = Some(route.next().to_string());
                Verdict::Continue
            }
            None => Verdict::drop_with(anyhow!("unknown SNI: {}", hello.sni)),
        }
    }
}
