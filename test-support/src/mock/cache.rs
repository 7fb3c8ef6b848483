//! 缓存/一致性协作接口的 Mock 实现

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Mock 的缓存一致性协作者
///
/// 记录写缓冲等待次数与缓存同步的调用情况。
pub struct MockCacheOps {
    flush_waits: AtomicUsize,
    sync_calls: AtomicUsize,
    synced_bytes: AtomicUsize,
    last_sync_paddr: AtomicU64,
}

impl MockCacheOps {
    /// 创建 Mock 缓存协作者
    pub const fn new() -> Self {
        Self {
            flush_waits: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
            synced_bytes: AtomicUsize::new(0),
            last_sync_paddr: AtomicU64::new(0),
        }
    }

    /// 等待 GPU 写缓冲回刷（Mock：仅计数）
    pub fn wait_write_flush(&self) {
        self.flush_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// 对一段物理连续内存执行缓存同步（Mock：仅记录）
    pub fn sync(&self, paddr: u64, len: usize) {
        self.sync_calls.fetch_add(1, Ordering::Relaxed);
        self.synced_bytes.fetch_add(len, Ordering::Relaxed);
        self.last_sync_paddr.store(paddr, Ordering::Relaxed);
    }

    /// 写缓冲等待的次数
    pub fn flush_waits(&self) -> usize {
        self.flush_waits.load(Ordering::Relaxed)
    }

    /// 缓存同步段的数量
    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::Relaxed)
    }

    /// 同步过的总字节数
    pub fn synced_bytes(&self) -> usize {
        self.synced_bytes.load(Ordering::Relaxed)
    }

    /// 最近一次同步段的起始物理地址
    pub fn last_sync_paddr(&self) -> u64 {
        self.last_sync_paddr.load(Ordering::Relaxed)
    }
}

impl Default for MockCacheOps {
    fn default() -> Self {
        Self::new()
    }
}
