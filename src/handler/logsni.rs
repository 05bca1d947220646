//! 记录每个新连接的 SNI / ALPN

use crate::handler::{Context, Handler, Verdict};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct LogSni;

pub fn factory(_config: Option<&serde_json::Value>) -> Result<Arc<dyn Handler>> {
    Ok(Arc::new(LogSni))
}

#[async_trait]
impl Handler for LogSni {
    fn name(&self) -> &'static str {
        "logsni"
    }

    async fn on_connect(&self, ctx: &mut Context) -> Verdict {
        match &ctx.hello {
            Some(hello) => info!(
                client = %ctx.client_addr,
                sni = %hello.sni,
                alpn = ?hello.alpn,
                "new connection"
            ),
            None => info!(client = %ctx.client_addr, sni = "<none>", "new connection"),
        }
        Verdict::Continue
    }
}
