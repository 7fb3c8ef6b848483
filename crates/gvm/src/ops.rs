//! 外部协作者接口
//!
//! 本 crate 只负责虚拟地址区间与物理页核算；GPU 页表编程、
//! 物理页的真正来源以及缓存一致性动作由外部模块实现，经由
//! 这里的 trait 在创建上下文时注入。所有调用都在持有上下文
//! vm 锁的前提下发生。

use alloc::vec::Vec;

use crate::address::{Ppn, Vpn};
use crate::error::GvmResult;
use crate::region::RegionFlags;

/// GPU 页表编程接口
///
/// 失败必须是"无部分生效"的：任一方法返回错误时页表内容与
/// 调用前一致，核算侧的回滚由调用方完成。
pub trait GpuMmuOps: Send + Sync {
    /// 自 start 起连续安装 pages 中的物理页
    fn install_pages(&self, start: Vpn, pages: &[Ppn], flags: RegionFlags) -> GvmResult<()>;

    /// 自 start 起拆除 nr_pages 个页表项
    fn teardown_pages(&self, start: Vpn, nr_pages: u32) -> GvmResult<()>;

    /// 更新已安装页的属性位
    fn update_pages(&self, start: Vpn, pages: &[Ppn], flags: RegionFlags) -> GvmResult<()>;
}

/// 物理页供给接口
pub trait PhysPageSupplier: Send + Sync {
    /// 申请 nr_pages 个物理页
    ///
    /// 失败返回 None，不产生部分分配。
    fn alloc_pages(&self, nr_pages: u32) -> Option<Vec<Ppn>>;

    /// 归还物理页
    ///
    /// sync_back 表示归还前需要把 CPU 缓存中的内容写回内存。
    fn free_pages(&self, pages: &[Ppn], sync_back: bool);
}

/// 缓存同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// CPU 缓存写回内存（设备将要读取）
    ToDevice,
    /// 使 CPU 缓存失效（CPU 将要读取设备写入的数据）
    ToCpu,
}

/// 缓存/一致性协作接口
pub trait GpuCacheOps: Send + Sync {
    /// 阻塞等待 GPU 写缓冲回刷
    ///
    /// 实现方以固定的周期预算等待，超出预算后直接返回，
    /// 不视为错误。
    fn wait_gpu_write_flush(&self);

    /// 对一段物理连续内存执行缓存同步
    fn sync_range(&self, paddr: u64, len: usize, dir: SyncDirection);
}
