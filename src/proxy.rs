//! 代理主循环
//!
//! 单任务收包、查表、派发；每个会话另有一个 backend→client pump。
//! 串行化的 demux 简化了 CID 学习的竞态：主索引/次索引的查找和
//! 新建会话都发生在同一个任务上。
//!
//! 收包路径：
//! 1. 按客户端地址查会话，命中则作为 Inbound 走链
//! 2. 未命中且是短头部：按配置长度截取 DCID 再查一次；命中说明
//!    客户端换了源端口 (尽力而为的快速路径)，重绑主索引
//! 3. 仍未命中：尝试解析 ClientHello，构建 Context 走链准入
//!
//! 热更新换链只影响之后准入的连接；在途会话继续用准入时的链。

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::handler::{forwarder, ChainOutcome, Context, Direction, HandlerChain, HandlerRegistry};
use crate::quic;
use crate::session::{Conn, SessionTable};
use anyhow::{bail, Context as _, Result};
use arc_swap::ArcSwap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 优雅退出时等 pump 排空的时限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// 可热更新的准入状态：handler 链 + 会话超时 + CID 截取长度
pub struct Admission {
    pub chain: Arc<HandlerChain>,
    /// 秒；0 是测试模式，清扫时视所有会话为空闲
    pub session_timeout: u64,
    pub cid_length: usize,
}

pub struct Proxy {
    sock: Arc<UdpSocket>,
    table: Arc<SessionTable>,
    pool: Arc<BufferPool>,
    admission: Arc<ArcSwap<Admission>>,
    cancel: CancellationToken,
    /// 配置里要求的监听地址，热更新时校验不可变
    configured_listen: SocketAddr,
}

impl Proxy {
    /// 组链、绑定监听 socket；任何一步失败都让启动以非零退出
    pub async fn bind(config: &Config, registry: &HandlerRegistry) -> Result<Self> {
        let chain = Arc::new(registry.build_chain(&config.handlers)?);
        let listen = config.listen_addr()?;
        let sock = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("failed to bind listen socket {}", listen))?;
        let bound = sock.local_addr()?;
        info!(listen = %bound, chain = ?chain.handler_names(), "proxy listening");

        let pool = BufferPool::new();
        Ok(Self {
            sock: Arc::new(sock),
            table: SessionTable::new(),
            pool,
            admission: Arc::new(ArcSwap::from_pointee(Admission {
                chain,
                session_timeout: config.session_timeout,
                cid_length: config.cid_length,
            })),
            cancel: CancellationToken::new(),
            configured_listen: listen,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            table: Arc::clone(&self.table),
            admission: Arc::clone(&self.admission),
            cancel: self.cancel.clone(),
            configured_listen: self.configured_listen,
        }
    }

    /// 跑到收到退出信号为止，然后优雅关闭
    pub async fn run(self) -> Result<()> {
        tokio::spawn(sweeper(
            Arc::clone(&self.table),
            Arc::clone(&self.admission),
            self.cancel.clone(),
        ));

        loop {
            let mut buf = self.pool.acquire();
            let (n, src) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                recv = self.sock.recv_from(&mut buf[..]) => match recv {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("recv error: {}", e);
                        continue;
                    }
                },
            };
            if n == 0 {
                continue;
            }
            self.dispatch(&buf[..n], src).await;
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    async fn dispatch(&self, datagram: &[u8], src: SocketAddr) {
        // 1. 主索引
        if let Some(conn) = self.table.lookup_by_client(&src) {
            self.dispatch_existing(&conn, datagram).await;
            return;
        }

        let admission = self.admission.load_full();

        // 2. 短头部按 DCID 找：客户端可能换了源端口
        if let Some(dcid) = quic::extract_short_header_dcid(datagram, admission.cid_length) {
            if let Some(conn) = self.table.lookup_by_cid(dcid) {
                debug!(
                    session = conn.session.id(),
                    old = %conn.session.client_addr(),
                    new = %src,
                    "client address rebound via CID"
                );
                self.table.rebind_client(&conn, src);
                self.dispatch_existing(&conn, datagram).await;
                return;
            }
        }

        // 3. 新连接准入
        let hello = match quic::parse_client_hello(datagram) {
            Ok(hello) => Some(hello),
            Err(e) => {
                debug!(client = %src, "ClientHello parse failed: {}", e);
                None
            }
        };

        let mut ctx = Context::new(
            src,
            datagram.to_vec(),
            Arc::clone(&self.sock),
            Arc::clone(&self.table),
            Arc::clone(&self.pool),
        );
        ctx.hello = hello;
        ctx.session_count = self.table.len();

        match admission.chain.connect(&mut ctx).await {
            ChainOutcome::Handled => match ctx.session.clone() {
                Some(session) => {
                    let conn = Conn::new(session, Arc::clone(&admission.chain), ctx);
                    self.table.insert(Arc::clone(&conn));
                    forwarder::spawn_backend_pump(conn);
                }
                None => error!("handler chain returned Handled without a session"),
            },
            ChainOutcome::Drop(Some(reason)) => {
                info!(client = %src, "connection dropped: {}", reason);
            }
            ChainOutcome::Drop(None) => {
                debug!(client = %src, "connection dropped");
            }
        }
    }

    async fn dispatch_existing(&self, conn: &Arc<Conn>, datagram: &[u8]) {
        let mut ctx = conn.ctx.lock().await;
        match conn
            .chain
            .packet(&mut ctx, datagram, Direction::Inbound)
            .await
        {
            ChainOutcome::Handled => {}
            ChainOutcome::Drop(reason) => {
                if let Some(e) = reason {
                    debug!(session = conn.session.id(), "packet dropped: {}", e);
                }
                drop(ctx);
                // pump 被唤醒后做拆除
                conn.session.close();
            }
        }
    }

    async fn graceful_shutdown(&self) {
        let open = self.table.len();
        info!(sessions = open, "shutting down");

        for conn in self.table.snapshot() {
            conn.session.close();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.table.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining = self.table.len();
        if remaining > 0 {
            warn!(sessions = remaining, "sessions did not drain before deadline");
        } else {
            info!("shutdown complete");
        }
    }
}

/// 对外的控制面：关闭、重载、观测
#[derive(Clone)]
pub struct ProxyHandle {
    table: Arc<SessionTable>,
    admission: Arc<ArcSwap<Admission>>,
    cancel: CancellationToken,
    configured_listen: SocketAddr,
}

impl ProxyHandle {
    /// 触发优雅关闭
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// 踢掉指定客户端的会话
    pub fn close_session(&self, client: SocketAddr) -> bool {
        match self.table.lookup_by_client(&client) {
            Some(conn) => conn.session.close(),
            None => false,
        }
    }

    /// 热更新：原子换掉 handler 链和会话超时
    ///
    /// `listen` 不允许变；拒绝时保持现状继续运行 (非致命)。
    pub fn reload(&self, config: &Config, registry: &HandlerRegistry) -> Result<()> {
        let new_listen = config.listen_addr()?;
        if new_listen != self.configured_listen {
            bail!(
                "'listen' cannot be changed without a restart (bound: {}, new: {})",
                self.configured_listen,
                new_listen
            );
        }

        let chain = Arc::new(registry.build_chain(&config.handlers)?);
        self.admission.store(Arc::new(Admission {
            chain,
            session_timeout: config.session_timeout,
            cid_length: config.cid_length,
        }));
        info!("configuration reloaded");
        Ok(())
    }
}

/// 空闲清扫：周期 ≈ session_timeout / 10，下限 10 秒
///
/// session_timeout == 0 是测试模式，每 50ms 清扫且视所有会话为空闲。
fn sweep_interval(timeout_secs: u64) -> Duration {
    if timeout_secs == 0 {
        Duration::from_millis(50)
    } else {
        Duration::from_secs((timeout_secs / 10).max(10))
    }
}

async fn sweeper(
    table: Arc<SessionTable>,
    admission: Arc<ArcSwap<Admission>>,
    cancel: CancellationToken,
) {
    loop {
        let interval = sweep_interval(admission.load().session_timeout);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let timeout_secs = admission.load().session_timeout;
        for conn in table.snapshot() {
            let idle = conn.session.idle_secs();
            if timeout_secs == 0 || idle >= timeout_secs {
                if conn.session.close() {
                    info!(
                        session = conn.session.id(),
                        idle_secs = idle,
                        "session idle timeout"
                    );
                }
            }
        }
    }
}
