//! 连接处理链
//!
//! 每个新连接按配置顺序走一遍 handler 链，由链上的 handler 决定
//! 路由、限流、丢弃或转发。语义与顺序：
//!
//! - `Continue`: 交给下一个 handler
//! - `Handled`: 链成功终止 (由 forwarder 这样的终结者返回)
//! - `Drop`: 终止并放弃该连接，原因会被记录
//!
//! 链走到末尾仍没有 handler 返回 `Handled` 属于配置错误，在启动时
//! 由 [`HandlerChain::new`] 拦下。
//!
//! # 注册表
//!
//! handler 类型名 → 工厂函数 的映射在进程启动时构建，之后只读。
//! 工厂在解析配置阶段快速失败。

pub mod forwarder;
pub mod logsni;
pub mod ratelimit;
pub mod simple_router;
pub mod sni_router;

pub use forwarder::Forwarder;
pub use logsni::LogSni;
pub use ratelimit::RateLimitGlobal;
pub use simple_router::SimpleRouter;
pub use sni_router::SniRouter;

use crate::buffer::BufferPool;
use crate::config::HandlerSpec;
use crate::quic::ClientHello;
use crate::session::{Session, SessionTable};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::error;

/// 被转发 datagram 的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 客户端 → 后端
    Inbound,
    /// 后端 → 客户端 (核心只在 pump 内部处理，不走链)
    Outbound,
}

/// 单个 handler 的裁决
pub enum Verdict {
    /// 交给链上的下一个 handler
    Continue,
    /// 链成功终止
    Handled,
    /// 放弃连接；`None` 表示静默丢弃
    Drop(Option<anyhow::Error>),
}

impl Verdict {
    pub fn drop_with(err: anyhow::Error) -> Self {
        Verdict::Drop(Some(err))
    }

    pub fn drop_silent() -> Self {
        Verdict::Drop(None)
    }
}

/// 整条链走完后的结果
pub enum ChainOutcome {
    Handled,
    Drop(Option<anyhow::Error>),
}

/// 随连接流经 handler 链的上下文
///
/// 从第一个 packet 到会话拆除为止都是同一份。已知的跨 handler
/// 状态是显式字段 (`backend`, `session_count`)，不用字符串袋。
pub struct Context {
    /// 客户端地址 (UDP 4 元组的对端)
    pub client_addr: SocketAddr,
    /// 触发建连的首个 datagram；forwarder 转发后清空以释放内存
    pub initial_packet: Vec<u8>,
    /// 解析成功时的 ClientHello；解析失败的连接为 None
    pub hello: Option<ClientHello>,
    /// 路由 handler 写入、forwarder 消费的后端地址
    pub backend: Option<String>,
    /// 链派发前由代理主循环填入的当前会话数
    pub session_count: usize,
    /// forwarder 建好会话后挂在这里
    pub session: Option<Arc<Session>>,
    /// 代理监听 socket，pump 用它回写客户端
    pub proxy_sock: Arc<UdpSocket>,
    /// 会话索引，pump 学到 CID 后回填
    pub table: Arc<SessionTable>,
    /// 读缓冲池
    pub pool: Arc<BufferPool>,
}

impl Context {
    pub fn new(
        client_addr: SocketAddr,
        initial_packet: Vec<u8>,
        proxy_sock: Arc<UdpSocket>,
        table: Arc<SessionTable>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            client_addr,
            initial_packet,
            hello: None,
            backend: None,
            session_count: 0,
            session: None,
            proxy_sock,
            table,
            pool,
        }
    }
}

/// 连接级中间件
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// 每个新连接调用一次，按链序
    async fn on_connect(&self, _ctx: &mut Context) -> Verdict {
        Verdict::Continue
    }

    /// 每个被转发的 datagram 调用 (核心只派发 Inbound)
    async fn on_packet(&self, _ctx: &mut Context, _packet: &[u8], _dir: Direction) -> Verdict {
        Verdict::Continue
    }

    /// 会话结束时恰好调用一次 (无论结束原因)
    async fn on_disconnect(&self, _ctx: &mut Context) {}

    /// 是否保证终止链 (on_connect 返回 Handled 或 Drop)
    fn terminal(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("name", &self.name()).finish()
    }
}

/// 按配置顺序组装好的 handler 链
#[derive(Debug)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    /// 组装并校验：链里必须有一个终结者，否则是配置错误
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Result<Self> {
        if handlers.is_empty() {
            bail!("handler chain is empty");
        }
        if !handlers.iter().any(|h| h.terminal()) {
            bail!(
                "handler chain has no terminating handler (add a 'forwarder'): [{}]",
                handlers
                    .iter()
                    .map(|h| h.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(Self { handlers })
    }

    pub async fn connect(&self, ctx: &mut Context) -> ChainOutcome {
        for handler in &self.handlers {
            match handler.on_connect(ctx).await {
                Verdict::Continue => continue,
                Verdict::Handled => return ChainOutcome::Handled,
                Verdict::Drop(reason) => return ChainOutcome::Drop(reason),
            }
        }
        // new() 校验过终结者存在，走到这里说明某个 terminal handler 食言了
        error!("handler chain completed without Handled");
        ChainOutcome::Drop(Some(anyhow!("handler chain completed without Handled")))
    }

    pub async fn packet(&self, ctx: &mut Context, packet: &[u8], dir: Direction) -> ChainOutcome {
        for handler in &self.handlers {
            match handler.on_packet(ctx, packet, dir).await {
                Verdict::Continue => continue,
                Verdict::Handled => return ChainOutcome::Handled,
                Verdict::Drop(reason) => return ChainOutcome::Drop(reason),
            }
        }
        ChainOutcome::Handled
    }

    pub async fn disconnect(&self, ctx: &mut Context) {
        for handler in &self.handlers {
            handler.on_disconnect(ctx).await;
        }
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    #[cfg(test)]
    pub(crate) fn empty_for_test() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

/// handler 工厂：吃配置 JSON，吐 handler 或配置错误
pub type HandlerFactory = fn(Option<&serde_json::Value>) -> Result<Arc<dyn Handler>>;

/// 进程级 handler 注册表，启动后不再变化
pub struct HandlerRegistry {
    factories: HashMap<&'static str, HandlerFactory>,
}

impl HandlerRegistry {
    /// 内建的封闭集合
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("simple-router", simple_router::factory);
        registry.register("sni-router", sni_router::factory);
        registry.register("ratelimit-global", ratelimit::factory);
        registry.register("logsni", logsni::factory);
        registry.register("forwarder", forwarder::factory);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: HandlerFactory) {
        self.factories.insert(name, factory);
    }

    /// 按配置顺序实例化整条链；未知类型和坏配置都在这里快速失败
    pub fn build_chain(&self, specs: &[HandlerSpec]) -> Result<HandlerChain> {
        let mut handlers = Vec::with_capacity(specs.len());
        for spec in specs {
            let factory = self
                .factories
                .get(spec.kind.as_str())
                .ok_or_else(|| anyhow!("unknown handler type: {}", spec.kind))?;
            let handler = factory(spec.config.as_ref())
                .map_err(|e| anyhow!("handler '{}': {}", spec.kind, e))?;
            handlers.push(handler);
        }
        HandlerChain::new(handlers)
    }
}
