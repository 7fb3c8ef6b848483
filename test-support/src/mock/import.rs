//! 外部导入来源的 Mock 实现

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Mock 的外部导入来源
///
/// 描述一段由外部持有的物理页。`dma_buf` 风格的来源在
/// resolve 阶段只报告页数（页号列表由附着方填充），共享
/// 分配器风格的来源则立即给出常驻页。
pub struct MockImportSource {
    base_ppn: u64,
    nr_pages: usize,
    dma_buf: bool,
    fail_resolve: AtomicBool,
    fail_attach: AtomicBool,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    releases: AtomicUsize,
}

impl MockImportSource {
    /// 创建共享分配器风格的来源：物理页 [base_ppn, base_ppn + nr_pages)
    pub const fn new_shared(base_ppn: u64, nr_pages: usize) -> Self {
        Self {
            base_ppn,
            nr_pages,
            dma_buf: false,
            fail_resolve: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    /// 创建外部缓冲对象风格的来源（页在附着前不可用）
    pub const fn new_dma_buf(nr_pages: usize) -> Self {
        Self {
            base_ppn: 0,
            nr_pages,
            dma_buf: true,
            fail_resolve: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    /// 是否为外部缓冲对象风格
    pub fn is_dma_buf(&self) -> bool {
        self.dma_buf
    }

    /// 令 resolve 失败
    pub fn fail_resolve(&self) {
        self.fail_resolve.store(true, Ordering::Relaxed);
    }

    /// 令 attach 失败
    pub fn fail_attach(&self) {
        self.fail_attach.store(true, Ordering::Relaxed);
    }

    /// 查询页数与起始物理页号
    pub fn resolve(&self) -> Result<(u64, usize), ()> {
        if self.fail_resolve.load(Ordering::Relaxed) {
            return Err(());
        }
        Ok((self.base_ppn, self.nr_pages))
    }

    /// 进入活跃使用状态
    pub fn attach(&self) -> Result<(), ()> {
        if self.fail_attach.load(Ordering::Relaxed) {
            return Err(());
        }
        self.attaches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 退出活跃使用状态
    pub fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::Relaxed);
    }

    /// 释放对外部缓冲的持有
    pub fn release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// attach 的次数
    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::Relaxed)
    }

    /// detach 的次数
    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::Relaxed)
    }

    /// release 的次数
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }
}
