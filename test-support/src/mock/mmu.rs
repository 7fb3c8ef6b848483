//! GPU 页表编程接口的 Mock 实现

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Mock 的 GPU 页表
///
/// 只统计安装/拆除的页数，不保存真实映射。支持按调用序号
/// 注入失败：第 `n` 次（从 0 计）之后的调用全部失败。
pub struct MockGpuMmu {
    installed: AtomicUsize,
    install_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
    update_calls: AtomicUsize,
    fail_install_from: AtomicUsize,
    fail_teardown_from: AtomicUsize,
    fail_update_from: AtomicUsize,
    last_install_start: AtomicU64,
    last_teardown_start: AtomicU64,
}

impl MockGpuMmu {
    /// 创建一个从不失败的 Mock 页表
    pub const fn new() -> Self {
        Self {
            installed: AtomicUsize::new(0),
            install_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            fail_install_from: AtomicUsize::new(usize::MAX),
            fail_teardown_from: AtomicUsize::new(usize::MAX),
            fail_update_from: AtomicUsize::new(usize::MAX),
            last_install_start: AtomicU64::new(0),
            last_teardown_start: AtomicU64::new(0),
        }
    }

    /// 自第 nth 次 install 调用（从 0 计）起全部失败
    pub fn fail_installs_from(&self, nth: usize) {
        self.fail_install_from.store(nth, Ordering::Relaxed);
    }

    /// 自第 nth 次 teardown 调用起全部失败
    pub fn fail_teardowns_from(&self, nth: usize) {
        self.fail_teardown_from.store(nth, Ordering::Relaxed);
    }

    /// 自第 nth 次 update 调用起全部失败
    pub fn fail_updates_from(&self, nth: usize) {
        self.fail_update_from.store(nth, Ordering::Relaxed);
    }

    /// 安装 nr_pages 个页表项
    pub fn install(&self, start_vpn: u64, nr_pages: usize) -> Result<(), ()> {
        let idx = self.install_calls.fetch_add(1, Ordering::Relaxed);
        if idx >= self.fail_install_from.load(Ordering::Relaxed) {
            return Err(());
        }
        self.installed.fetch_add(nr_pages, Ordering::Relaxed);
        self.last_install_start.store(start_vpn, Ordering::Relaxed);
        Ok(())
    }

    /// 拆除 nr_pages 个页表项
    pub fn teardown(&self, start_vpn: u64, nr_pages: usize) -> Result<(), ()> {
        let idx = self.teardown_calls.fetch_add(1, Ordering::Relaxed);
        if idx >= self.fail_teardown_from.load(Ordering::Relaxed) {
            return Err(());
        }
        self.installed.fetch_sub(nr_pages, Ordering::Relaxed);
        self.last_teardown_start.store(start_vpn, Ordering::Relaxed);
        Ok(())
    }

    /// 更新已安装页的属性
    pub fn update(&self, _start_vpn: u64, _nr_pages: usize) -> Result<(), ()> {
        let idx = self.update_calls.fetch_add(1, Ordering::Relaxed);
        if idx >= self.fail_update_from.load(Ordering::Relaxed) {
            return Err(());
        }
        Ok(())
    }

    /// 当前安装在页表中的页数
    pub fn installed_pages(&self) -> usize {
        self.installed.load(Ordering::Relaxed)
    }

    /// install 被调用的次数
    pub fn install_calls(&self) -> usize {
        self.install_calls.load(Ordering::Relaxed)
    }

    /// teardown 被调用的次数
    pub fn teardown_calls(&self) -> usize {
        self.teardown_calls.load(Ordering::Relaxed)
    }

    /// update 被调用的次数
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::Relaxed)
    }

    /// 最近一次 install 的起始页号
    pub fn last_install_start(&self) -> u64 {
        self.last_install_start.load(Ordering::Relaxed)
    }

    /// 最近一次 teardown 的起始页号
    pub fn last_teardown_start(&self) -> u64 {
        self.last_teardown_start.load(Ordering::Relaxed)
    }
}

impl Default for MockGpuMmu {
    fn default() -> Self {
        Self::new()
    }
}
