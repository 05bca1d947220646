//! 固定大小的 UDP 读缓冲池
//!
//! 每次 socket 读取都从池里取一块 65535 字节的缓冲，转发完立即归还，
//! 把稳态分配压到常数。取用永不阻塞：空闲链表空了就新分配一块。
//! 归还的缓冲可能带有残留数据，消费方只能依赖读取返回的长度。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// 最大 UDP datagram 长度
pub const BUF_SIZE: usize = 65535;

/// 空闲链表的容量上限，超出的缓冲直接丢给分配器
const DEFAULT_MAX_IDLE: usize = 256;

pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    max_idle: usize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// 取一块缓冲；池空时退回到新分配
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let buf = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };
        let buf = buf.unwrap_or_else(|| vec![0u8; BUF_SIZE].into_boxed_slice());
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, buf: Box<[u8]>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    /// (acquired, released) 累计计数
    pub fn stats(&self) -> (u64, u64) {
        (
            self.acquired.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
        )
    }

    /// 当前空闲链表长度
    pub fn idle_len(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// 在飞行中的缓冲，同一时刻只属于一个任务；Drop 时归还池里
pub struct PooledBuf {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer already released")
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer already released")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
