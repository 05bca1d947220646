//! UDP 转发器：链的终结者
//!
//! OnConnect 时解析后端地址、建一个 connect 过的 UDP socket
//! (让内核过滤回程源地址)、转发首包并挂起 backend→client pump。
//! 之后客户端方向的每个 datagram 走 OnPacket 写往后端。

use crate::handler::{Context, Direction, Handler, Verdict};
use crate::quic;
use crate::session::{Conn, Session};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 后端读超时；空闲清扫通常先触发，这是兜底
pub const READ_DEADLINE: Duration = Duration::from_secs(300);

pub struct Forwarder;

pub fn factory(_config: Option<&serde_json::Value>) -> Result<Arc<dyn Handler>> {
    Ok(Arc::new(Forwarder))
}

async fn resolve(backend: &str) -> Result<SocketAddr> {
    lookup_host(backend)
        .await
        .map_err(|e| anyhow!("failed to resolve backend '{}': {}", backend, e))?
        .next()
        .ok_or_else(|| anyhow!("backend '{}' resolved to no addresses", backend))
}

#[async_trait]
impl Handler for Forwarder {
    fn name(&self) -> &'static str {
        "forwarder"
    }

    fn terminal(&self) -> bool {
        true
    }

    async fn on_connect(&self, ctx: &mut Context) -> Verdict {
        let backend = match ctx.backend.as_deref() {
            Some(b) if !b.is_empty() => b.to_string(),
            _ => return Verdict::drop_with(anyhow!("no backend address")),
        };

        let backend_addr = match resolve(&backend).await {
            Ok(addr) => addr,
            Err(e) => return Verdict::drop_with(e),
        };

        let bind_addr: SocketAddr = if backend_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let backend_sock = match UdpSocket::bind(bind_addr).await {
            Ok(sock) => sock,
            Err(e) => {
                return Verdict::drop_with(anyhow!("failed to bind backend socket: {}", e))
            }
        };
        if let Err(e) = backend_sock.connect(backend_addr).await {
            return Verdict::drop_with(anyhow!(
                "failed to connect to backend {}: {}",
                backend_addr,
                e
            ));
        }

        let session = Session::new(ctx.client_addr, backend_addr, Arc::new(backend_sock));

        if !ctx.initial_packet.is_empty() {
            if let Err(e) = session.backend_sock().send(&ctx.initial_packet).await {
                return Verdict::drop_with(anyhow!("failed to forward initial packet: {}", e));
            }
        }
        session.touch();
        // 首包已转发，释放 (每连接 ~1.4KB)
        ctx.initial_packet = Vec::new();

        info!(
            session = session.id(),
            client = %ctx.client_addr,
            backend = %backend,
            "session established"
        );
        ctx.session = Some(session);

        Verdict::Handled
    }

    async fn on_packet(&self, ctx: &mut Context, packet: &[u8], dir: Direction) -> Verdict {
        let session = match &ctx.session {
            Some(session) => session,
            None => return Verdict::drop_with(anyhow!("no session")),
        };

        // 关闭中的会话：静默丢弃，避免写已放弃的 socket
        if session.is_closed() {
            return Verdict::drop_silent();
        }

        session.touch();

        if dir == Direction::Inbound {
            if let Err(e) = session.backend_sock().send(packet).await {
                warn!(session = session.id(), "write to backend failed: {}", e);
                return Verdict::drop_with(anyhow!("write to backend failed: {}", e));
            }
        }
        // Outbound 由 backend→client pump 自己处理

        Verdict::Handled
    }

    async fn on_disconnect(&self, ctx: &mut Context) {
        if let Some(session) = &ctx.session {
            // CAS 赢家负责收尾日志；输家说明别处已经在关了
            if session.close() {
                info!(
                    session = session.id(),
                    duration = ?session.created_at().elapsed(),
                    "closing session"
                );
            }
        }
    }
}

/// backend→client pump，每个会话一个任务
///
/// 读一个 datagram → 学习 SCID → 经监听 socket 回写客户端。
/// CID 登记发生在写客户端之前：客户端要先收到这个包才可能用
/// 新 CID 发包，网络往返保证了索引先就绪。
///
/// 退出条件：读/写错误、读超时、关闭标志被置位。退出时做一次
/// 完整拆除 (移除索引 + 链上 on_disconnect)。
pub fn spawn_backend_pump(conn: Arc<Conn>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (proxy_sock, table, pool) = {
            let ctx = conn.ctx.lock().await;
            (
                Arc::clone(&ctx.proxy_sock),
                Arc::clone(&ctx.table),
                Arc::clone(&ctx.pool),
            )
        };
        let session = Arc::clone(&conn.session);

        loop {
            if session.is_closed() {
                break;
            }

            let mut buf = pool.acquire();

            let n = tokio::select! {
                _ = session.closed() => break,
                read = timeout(READ_DEADLINE, session.backend_sock().recv(&mut buf[..])) => {
                    match read {
                        // 读超时:空闲兜底
                        Err(_) => break,
                        // UDP 上正常关闭与读错误不可区分，静默退出
                        Ok(Err(_)) => break,
                        Ok(Ok(n)) => n,
                    }
                }
            };

            // 阻塞读期间会话可能已被关闭
            if session.is_closed() {
                break;
            }

            session.touch();

            if let Some(scid) = quic::extract_long_header_scid(&buf[..n]) {
                debug!(
                    session = session.id(),
                    cid = %hex(&scid),
                    "learned server CID"
                );
                table.index_cid(scid, &conn);
            }

            if let Err(e) = proxy_sock.send_to(&buf[..n], session.client_addr()).await {
                warn!(session = session.id(), "write to client failed: {}", e);
                break;
            }
        }

        table.remove(&conn);
        let chain = Arc::clone(&conn.chain);
        let mut ctx = conn.ctx.lock().await;
        chain.disconnect(&mut ctx).await;
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::test_context;

    #[tokio::test]
    async fn test_on_connect_requires_backend() {
        let handler = factory(None).unwrap();
        let mut ctx = test_context().await;
        match handler.on_connect(&mut ctx).await {
            Verdict::Drop(Some(e)) => assert!(e.to_string().contains("no backend address")),
            _ => panic!("expected Drop"),
        }
        assert!(ctx.session.is_none());
    }

    #[tokio::test]
    async fn test_on_connect_resolve_failure() {
        let handler = factory(None).unwrap();
        let mut ctx = test_context().await;
        ctx.backend = Some("no-such-host.invalid:443".to_string());
        assert!(matches!(handler.on_connect(&mut ctx).await, Verdict::Drop(Some(_))));
        assert!(ctx.session.is_none());
    }

    #[tokio::test]
    async fn test_on_connect_forwards_initial_packet() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let handler = factory(None).unwrap();
        let mut ctx = test_context().await;
        ctx.backend = Some(backend_addr.to_string());
        ctx.initial_packet = vec![0xCA, 0xFE, 0xBA, 0xBE];

        assert!(matches!(handler.on_connect(&mut ctx).await, Verdict::Handled));

        // 首包到达后端
        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(1), backend.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(&buf[..n], &[0xCA, 0xFE, 0xBA, 0xBE]);

        // 首包缓冲已释放，会话已挂上
        assert!(ctx.initial_packet.is_empty());
        let session = ctx.session.as_ref().expect("session missing");
        assert_eq!(session.backend_addr(), backend_addr);
    }

    #[tokio::test]
    async fn test_on_packet_writes_inbound() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let handler = factory(None).unwrap();
        let mut ctx = test_context().await;
        ctx.backend = Some(backend_addr.to_string());
        ctx.initial_packet = vec![0x01];
        handler.on_connect(&mut ctx).await;

        let mut buf = [0u8; 64];
        backend.recv_from(&mut buf).await.unwrap();

        let verdict = handler
            .on_packet(&mut ctx, &[0x02, 0x03], Direction::Inbound)
            .await;
        assert!(matches!(verdict, Verdict::Handled));

        let (n, _) = timeout(Duration::from_secs(1), backend.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(&buf[..n], &[0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_on_packet_closed_session_drops_silently() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let handler = factory(None).unwrap();
        let mut ctx = test_context().await;
        ctx.backend = Some(backend.local_addr().unwrap().to_string());
        ctx.initial_packet = vec![0x01];
        handler.on_connect(&mut ctx).await;

        ctx.session.as_ref().unwrap().close();

        match handler.on_packet(&mut ctx, &[0x02], Direction::Inbound).await {
            Verdict::Drop(None) => {}
            _ => panic!("expected silent Drop"),
        }
    }

    #[tokio::test]
    async fn test_on_disconnect_closes_once() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let handler = factory(None).unwrap();
        let mut ctx = test_context().await;
        ctx.backend = Some(backend.local_addr().unwrap().to_string());
        ctx.initial_packet = vec![0x01];
        handler.on_connect(&mut ctx).await;

        let session = Arc::clone(ctx.session.as_ref().unwrap());
        assert!(!session.is_closed());

        handler.on_disconnect(&mut ctx).await;
        assert!(session.is_closed());

        // 再次调用无害
        handler.on_disconnect(&mut ctx).await;
        assert!(session.is_closed());
    }
}
