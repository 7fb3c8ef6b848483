//! 页用量核算
//!
//! [`UsageCounter`] 是带上限的原子页计数器。每次物理页提交同时
//! 受两级配额约束：所属上下文一级、整个设备一级，两级都预留
//! 成功提交才被放行。计数器使用无锁 CAS 更新，可以在不持 vm
//! 锁的情况下安全读取。

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{GvmError, GvmResult};

/// 带上限的页用量计数器
#[derive(Debug)]
pub struct UsageCounter {
    cur_pages: AtomicU32,
    max_pages: u32,
}

impl UsageCounter {
    /// 创建上限为 max_pages 的计数器
    pub const fn new(max_pages: u32) -> Self {
        UsageCounter {
            cur_pages: AtomicU32::new(0),
            max_pages,
        }
    }

    /// 预留 nr_pages 页的配额
    ///
    /// 以 CAS 循环原子完成；会超过上限时不改动计数，返回
    /// [`GvmError::OutOfMemory`]。nr_pages 为 0 属于调用方错误。
    pub fn request_pages(&self, nr_pages: u32) -> GvmResult<()> {
        debug_assert!(nr_pages > 0);

        if self.max_pages < nr_pages {
            log::warn!(
                "memory usage cap reached: cap {} pages, {} new pages requested",
                self.max_pages,
                nr_pages
            );
            return Err(GvmError::OutOfMemory);
        }

        let mut cur = self.cur_pages.load(Ordering::Relaxed);
        loop {
            // 剩余配额是否足够？
            if self.max_pages - nr_pages < cur {
                log::warn!(
                    "memory usage cap reached: {} pages used, cap {} pages, {} new pages requested",
                    cur,
                    self.max_pages,
                    nr_pages
                );
                return Err(GvmError::OutOfMemory);
            }

            match self.cur_pages.compare_exchange(
                cur,
                cur + nr_pages,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => cur = observed,
            }
        }
    }

    /// 归还 nr_pages 页配额
    pub fn release_pages(&self, nr_pages: u32) {
        let prev = self.cur_pages.fetch_sub(nr_pages, Ordering::Relaxed);
        debug_assert!(prev >= nr_pages, "usage counter underflow");
    }

    /// 当前已用页数
    pub fn current(&self) -> u32 {
        self.cur_pages.load(Ordering::Relaxed)
    }

    /// 上限页数
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }
}

/// 同时向上下文与设备两级计数器预留配额
///
/// 两级都成功才算成功；设备级失败时回滚已预留的上下文级配额，
/// 保证"全有或全无"。
pub(crate) fn request_pages_dual(
    ctx: &UsageCounter,
    dev: &UsageCounter,
    nr_pages: u32,
) -> GvmResult<()> {
    ctx.request_pages(nr_pages)?;
    if let Err(e) = dev.request_pages(nr_pages) {
        ctx.release_pages(nr_pages);
        return Err(e);
    }
    Ok(())
}

/// 同时归还两级配额
pub(crate) fn release_pages_dual(ctx: &UsageCounter, dev: &UsageCounter, nr_pages: u32) {
    ctx.release_pages(nr_pages);
    dev.release_pages(nr_pages);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_within_cap() {
        let usage = UsageCounter::new(100);
        assert!(usage.request_pages(60).is_ok());
        assert!(usage.request_pages(40).is_ok());
        assert_eq!(usage.current(), 100);
    }

    #[test]
    fn test_request_over_cap_untouched() {
        let usage = UsageCounter::new(100);
        assert!(usage.request_pages(60).is_ok());
        assert_eq!(usage.request_pages(41), Err(GvmError::OutOfMemory));
        // 失败不改动计数
        assert_eq!(usage.current(), 60);
    }

    #[test]
    fn test_request_larger_than_cap() {
        let usage = UsageCounter::new(10);
        assert_eq!(usage.request_pages(11), Err(GvmError::OutOfMemory));
        assert_eq!(usage.current(), 0);
    }

    #[test]
    fn test_release_pages() {
        let usage = UsageCounter::new(100);
        usage.request_pages(50).unwrap();
        usage.release_pages(20);
        assert_eq!(usage.current(), 30);
    }

    #[test]
    fn test_dual_request_rolls_back_on_device_failure() {
        let ctx = UsageCounter::new(100);
        let dev = UsageCounter::new(10);
        assert_eq!(
            request_pages_dual(&ctx, &dev, 20),
            Err(GvmError::OutOfMemory)
        );
        // 设备级拒绝时上下文级预留必须回滚
        assert_eq!(ctx.current(), 0);
        assert_eq!(dev.current(), 0);
    }

    #[test]
    fn test_dual_request_and_release() {
        let ctx = UsageCounter::new(100);
        let dev = UsageCounter::new(100);
        request_pages_dual(&ctx, &dev, 30).unwrap();
        assert_eq!(ctx.current(), 30);
        assert_eq!(dev.current(), 30);
        release_pages_dual(&ctx, &dev, 30);
        assert_eq!(ctx.current(), 0);
        assert_eq!(dev.current(), 0);
    }
}
