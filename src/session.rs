//! 会话与会话索引
//!
//! 一个会话对应一条 客户端↔后端 的映射，持有自己的后端 UDP socket。
//! 索引有两层：
//! - 主索引: 客户端地址 → 连接
//! - 次索引: Connection ID → 连接，由 backend→client pump 在观察到
//!   服务端选择的 SCID 时惰性填充。客户端后续的短头部包携带的 DCID
//!   就是这些服务端 CID，必须能找回同一个会话。

use crate::handler::{Context, HandlerChain};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::warn;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 一条活跃的 客户端↔后端 映射
///
/// 字段要么构造后不变，要么是原子的：`last_activity` 和 `closed`
/// 被监听任务和 pump 任务同时访问，`client_addr` 可能因客户端换端口
/// 被更新、同时被空闲清扫读取。没有任何跨会话的锁。
pub struct Session {
    id: u64,
    client_addr: RwLock<SocketAddr>,
    backend_addr: SocketAddr,
    backend_sock: Arc<UdpSocket>,
    created_at: Instant,
    /// 距 created_at 的秒数，单调
    last_activity: AtomicU64,
    /// 至多置位一次；置位后任何任务不得再写后端 socket
    closed: AtomicBool,
    closed_notify: Notify,
    /// 本会话在次索引里登记过的 CID，移除会话时一并清掉
    cids: Mutex<Vec<Bytes>>,
}

impl Session {
    pub fn new(
        client_addr: SocketAddr,
        backend_addr: SocketAddr,
        backend_sock: Arc<UdpSocket>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client_addr: RwLock::new(client_addr),
            backend_addr,
            backend_sock,
            created_at: Instant::now(),
            last_activity: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            cids: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        *self.client_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_client_addr(&self, addr: SocketAddr) {
        *self.client_addr.write().unwrap_or_else(|e| e.into_inner()) = addr;
    }

    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    pub fn backend_sock(&self) -> &Arc<UdpSocket> {
        &self.backend_sock
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// 每转发一个 datagram (任一方向) 调用一次
    pub fn touch(&self) {
        self.last_activity
            .store(self.created_at.elapsed().as_secs(), Ordering::Relaxed);
    }

    /// 距最后一次活动的秒数
    pub fn idle_secs(&self) -> u64 {
        self.created_at
            .elapsed()
            .as_secs()
            .saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// CAS 置位关闭标志，返回是否是本次调用赢得关闭权
    ///
    /// 赢家负责收尾日志；实际的 socket 释放发生在所有引用都消失时，
    /// pump 会被唤醒并退出。
    pub fn close(&self) -> bool {
        let won = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.closed_notify.notify_waiters();
        }
        won
    }

    /// 等待关闭标志被置位
    pub async fn closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// 登记一个已学习的 CID；重复登记返回 false
    fn record_cid(&self, cid: &Bytes) -> bool {
        let mut cids = self.cids.lock().unwrap_or_else(|e| e.into_inner());
        if cids.iter().any(|c| c == cid) {
            return false;
        }
        cids.push(cid.clone());
        true
    }

    fn drain_cids(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.cids.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// 连接记录：会话 + 准入时的 handler 链 + 贯穿该连接的 Context
///
/// 会话表和 pump 各持有一个 `Arc<Conn>`；表里的引用随移除消失，
/// pump 的引用随任务退出消失，后端 socket 在最后一个引用消失时释放。
/// 热更新换掉的是新连接用的链，已准入的连接继续用这里的 `chain`。
pub struct Conn {
    pub session: Arc<Session>,
    pub chain: Arc<HandlerChain>,
    pub ctx: tokio::sync::Mutex<Context>,
}

impl Conn {
    pub fn new(session: Arc<Session>, chain: Arc<HandlerChain>, ctx: Context) -> Arc<Self> {
        Arc::new(Self {
            session,
            chain,
            ctx: tokio::sync::Mutex::new(ctx),
        })
    }
}

/// 并发会话索引：多读少写
///
/// `insert` 成功后，其他任务随后的 `lookup_by_client` 一定能看到。
/// `len` 是 O(1) 原子读，限流 handler 每个新连接都要查。
pub struct SessionTable {
    by_client: DashMap<SocketAddr, Arc<Conn>>,
    by_cid: DashMap<Bytes, Arc<Conn>>,
    live: AtomicUsize,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_client: DashMap::new(),
            by_cid: DashMap::new(),
            live: AtomicUsize::new(0),
        })
    }

    pub fn insert(&self, conn: Arc<Conn>) {
        let addr = conn.session.client_addr();
        if self.by_client.insert(addr, conn).is_some() {
            warn!(client = %addr, "replaced an existing session for the same client address");
        }
        self.sync_len();
    }

    pub fn lookup_by_client(&self, addr: &SocketAddr) -> Option<Arc<Conn>> {
        self.by_client.get(addr).map(|e| Arc::clone(e.value()))
    }

    pub fn lookup_by_cid(&self, cid: &[u8]) -> Option<Arc<Conn>> {
        self.by_cid.get(cid).map(|e| Arc::clone(e.value()))
    }

    /// 给连接增加一个次索引键；幂等，冲突时后写者赢
    pub fn index_cid(&self, cid: Bytes, conn: &Arc<Conn>) {
        if conn.session.is_closed() {
            return;
        }
        if !conn.session.record_cid(&cid) {
            return;
        }
        if let Some(old) = self.by_cid.insert(cid, Arc::clone(conn)) {
            if !Arc::ptr_eq(&old, conn) {
                warn!(
                    old_session = old.session.id(),
                    new_session = conn.session.id(),
                    "CID conflict between sessions, keeping the newer one"
                );
            }
        }
    }

    /// 客户端换了源端口但 CID 还能对上：换主索引键
    pub fn rebind_client(&self, conn: &Arc<Conn>, new_addr: SocketAddr) {
        let old_addr = conn.session.client_addr();
        if old_addr == new_addr {
            return;
        }
        self.by_client
            .remove_if(&old_addr, |_, v| Arc::ptr_eq(v, conn));
        conn.session.set_client_addr(new_addr);
        self.by_client.insert(new_addr, Arc::clone(conn));
        self.sync_len();
    }

    /// 移除主索引和该会话名下的全部次索引键；幂等
    pub fn remove(&self, conn: &Arc<Conn>) {
        let addr = conn.session.client_addr();
        self.by_client.remove_if(&addr, |_, v| Arc::ptr_eq(v, conn));
        for cid in conn.session.drain_cids() {
            self.by_cid.remove_if(&cid, |_, v| Arc::ptr_eq(v, conn));
        }
        self.sync_len();
    }

    /// 空闲清扫用的快照
    pub fn snapshot(&self) -> Vec<Arc<Conn>> {
        self.by_client
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sync_len(&self) {
        self.live.store(self.by_client.len(), Ordering::Relaxed);
    }
}
