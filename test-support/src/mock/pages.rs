//! 物理页供给接口的 Mock 实现

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Mock 的物理页供给方
///
/// 从 `FIRST_PPN` 起按序发放物理页号，容量有限。
/// 支持按调用序号注入失败。
pub struct MockPageSupplier {
    capacity: usize,
    outstanding: AtomicUsize,
    next_ppn: AtomicU64,
    alloc_calls: AtomicUsize,
    free_calls: AtomicUsize,
    fail_alloc_from: AtomicUsize,
    synced_back_pages: AtomicUsize,
}

impl MockPageSupplier {
    /// 测试用物理页号的起点（避开 0，便于识别未初始化值）
    pub const FIRST_PPN: u64 = 0x8_0000;

    /// 创建一个容量为 capacity 页的供给方
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: AtomicUsize::new(0),
            next_ppn: AtomicU64::new(Self::FIRST_PPN),
            alloc_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
            fail_alloc_from: AtomicUsize::new(usize::MAX),
            synced_back_pages: AtomicUsize::new(0),
        }
    }

    /// 自第 nth 次 alloc 调用（从 0 计）起全部失败
    pub fn fail_allocs_from(&self, nth: usize) {
        self.fail_alloc_from.store(nth, Ordering::Relaxed);
    }

    /// 申请 nr_pages 个物理页，返回第一个页号
    ///
    /// 页号连续递增；失败时无任何副作用。
    pub fn alloc(&self, nr_pages: usize) -> Option<u64> {
        let idx = self.alloc_calls.fetch_add(1, Ordering::Relaxed);
        if idx >= self.fail_alloc_from.load(Ordering::Relaxed) {
            return None;
        }
        if self.outstanding.load(Ordering::Relaxed) + nr_pages > self.capacity {
            return None;
        }
        self.outstanding.fetch_add(nr_pages, Ordering::Relaxed);
        Some(self.next_ppn.fetch_add(nr_pages as u64, Ordering::Relaxed))
    }

    /// 归还 nr_pages 个物理页
    pub fn free(&self, nr_pages: usize, sync_back: bool) {
        self.free_calls.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(nr_pages, Ordering::Relaxed);
        if sync_back {
            self.synced_back_pages.fetch_add(nr_pages, Ordering::Relaxed);
        }
    }

    /// 当前借出未还的页数
    pub fn outstanding_pages(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// alloc 被调用的次数
    pub fn alloc_calls(&self) -> usize {
        self.alloc_calls.load(Ordering::Relaxed)
    }

    /// free 被调用的次数
    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::Relaxed)
    }

    /// 归还时要求回写 CPU 缓存的总页数
    pub fn synced_back_pages(&self) -> usize {
        self.synced_back_pages.load(Ordering::Relaxed)
    }
}
