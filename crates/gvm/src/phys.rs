//! 物理页提交与释放
//!
//! 把物理页供给方、两级配额计数与区域的已提交前缀绑在一起，
//! 保证任何失败路径上三者一致回滚。导入区域的物理页由外部
//! 持有，不经过这里的供给与核算。

use core::mem;

use crate::address::Ppn;
use crate::error::{GvmError, GvmResult};
use crate::ops::PhysPageSupplier;
use crate::region::{RegionFlags, VaRegion};
use crate::usage::{self, UsageCounter};

/// 在区域尾部提交 nr_pages 个物理页
///
/// 先预留两级配额，再向供给方要页；供给方失败时回滚配额，
/// 区域保持原状。零页提交按成功处理。
pub(crate) fn commit_pages(
    reg: &mut VaRegion,
    supplier: &dyn PhysPageSupplier,
    ctx_usage: &UsageCounter,
    dev_usage: &UsageCounter,
    nr_pages: u32,
) -> GvmResult<()> {
    debug_assert!(reg.imported.is_none(), "imported regions have no local backing");
    debug_assert!(
        reg.nr_pages - reg.nr_alloc_pages() >= nr_pages,
        "commit beyond region capacity"
    );
    // 不可增长的区域只接受一次性的完整提交
    debug_assert!(reg.flags.contains(RegionFlags::GROWABLE) || reg.nr_pages == nr_pages);

    if nr_pages == 0 {
        return Ok(());
    }

    usage::request_pages_dual(ctx_usage, dev_usage, nr_pages)?;

    let Some(pages) = supplier.alloc_pages(nr_pages) else {
        usage::release_pages_dual(ctx_usage, dev_usage, nr_pages);
        return Err(GvmError::OutOfMemory);
    };
    debug_assert_eq!(pages.len(), nr_pages as usize);

    reg.phy_pages.extend_from_slice(&pages);
    Ok(())
}

/// 归还区域尾部 nr_pages 个已提交的物理页
///
/// CPU 侧启用缓存的区域在归还前要求供给方回写缓存。
/// 零页释放是空操作。
pub(crate) fn release_pages(
    reg: &mut VaRegion,
    supplier: &dyn PhysPageSupplier,
    ctx_usage: &UsageCounter,
    dev_usage: &UsageCounter,
    nr_pages: u32,
) {
    debug_assert!(reg.imported.is_none(), "imported regions have no local backing");
    debug_assert!(reg.nr_alloc_pages() >= nr_pages, "free beyond committed pages");
    // 不可增长的区域只接受一次性的完整释放
    debug_assert!(
        reg.flags.contains(RegionFlags::GROWABLE) || reg.nr_alloc_pages() == nr_pages
    );

    if nr_pages == 0 {
        return;
    }

    let keep = reg.phy_pages.len() - nr_pages as usize;
    let sync_back = reg.flags.contains(RegionFlags::CPU_CACHED);
    supplier.free_pages(&reg.phy_pages[keep..], sync_back);
    reg.phy_pages.truncate(keep);

    usage::release_pages_dual(ctx_usage, dev_usage, nr_pages);
}

/// 释放区域的全部物理后备
///
/// 区域销毁的收尾步骤。导入区域释放对外部来源的持有而不是
/// 归还页；其余区域把已提交的页全部还给供给方。
pub(crate) fn free_phy_pages(
    reg: &mut VaRegion,
    supplier: &dyn PhysPageSupplier,
    ctx_usage: &UsageCounter,
    dev_usage: &UsageCounter,
) {
    if reg.imported.is_some() {
        // 页归外部所有：丢弃本地记录并释放来源引用
        reg.imported = None;
        reg.phy_pages.clear();
        return;
    }

    let committed = reg.nr_alloc_pages();
    release_pages(reg, supplier, ctx_usage, dev_usage, committed);
    // 页数组本身也一并收回
    mem::take(&mut reg.phy_pages);
}

/// 建立区域的物理后备：容量 vsize 页，先提交 psize 页
pub(crate) fn alloc_backing(
    reg: &mut VaRegion,
    supplier: &dyn PhysPageSupplier,
    ctx_usage: &UsageCounter,
    dev_usage: &UsageCounter,
    vsize: u32,
    psize: u32,
) -> GvmResult<()> {
    debug_assert!(vsize > 0);

    if psize > vsize || vsize > reg.nr_pages {
        return Err(GvmError::InvalidArguments);
    }

    // 防止页数组大小计算回绕
    if (vsize as usize).checked_mul(mem::size_of::<Ppn>()).is_none() {
        return Err(GvmError::Failed);
    }

    reg.phy_pages.reserve_exact(vsize as usize);
    commit_pages(reg, supplier, ctx_usage, dev_usage, psize)
}
