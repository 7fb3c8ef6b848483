//! VA 区域对象
//!
//! [`VaRegion`] 描述 GPU 虚拟地址空间中一段连续的区间，可能是
//! 空闲的，也可能承载一次分配或一个导入缓冲。区域的容量
//! （nr_pages）在分配后固定，物理后备以"前缀提交"的方式管理：
//! `phy_pages` 向量的长度就是已提交页数，不另外维护计数。

use alloc::boxed::Box;
use alloc::collections::btree_map::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;
use uapi::GpuMemFlags;

use crate::address::{PAGE_SHIFT, Ppn, Vpn, VpnRange};
use crate::error::{GvmError, GvmResult};
use crate::import::ImportSource;

/// 地址空间分区
///
/// 每个上下文的地址空间固定划分为三个 zone；只有同 zone 的
/// 空闲区域才允许合并。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// 常驻内存区：分配时即完整提交（低地址区）
    Pmem,
    /// 可执行内存区：GPU 着色器代码
    Exec,
    /// 可增长内存区：支持按需提交的大地址区
    Tmem,
}

bitflags! {
    /// 区域能力与状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// 空闲区域（未分配）
        const FREE = 1 << 0;
        /// 已提交页数允许变化
        const GROWABLE = 1 << 1;
        /// 由 GPU 缺页驱动增长，resize 增量按硬件块大小量化
        const GROW_ON_PF = 1 << 2;
        /// CPU 侧启用缓存
        const CPU_CACHED = 1 << 3;
        /// GPU 侧启用缓存
        const GPU_CACHED = 1 << 4;
        /// CPU 可读
        const CPU_RD = 1 << 5;
        /// CPU 可写
        const CPU_WR = 1 << 6;
        /// GPU 可读
        const GPU_RD = 1 << 7;
        /// GPU 可写
        const GPU_WR = 1 << 8;
        /// GPU 不可执行
        const GPU_NX = 1 << 9;
        /// 与同一核心组内的观察者保持一致性
        const SHARE_LOCAL = 1 << 10;
        /// 与系统内所有观察者保持一致性
        const SHARE_SYSTEM = 1 << 11;
        /// 已请求释放，等待最后一个外部引用消失
        const DELAYED_FREE = 1 << 12;
    }
}

/// 一个活跃的用户态 CPU 映射
///
/// 由外部的缺页/解除映射处理路径创建和销毁；区域存在任何
/// 映射期间不允许 resize，也不允许真正销毁。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMapping {
    /// 用户态起始地址
    pub uaddr: u64,
    /// 映射的页数
    pub nr_pages: u32,
    /// 映射相对区域起始的页偏移
    pub page_off: u64,
}

/// 外部导入的物理页来源及其活跃引用计数
pub struct ImportedBuffer {
    pub(crate) source: Box<dyn ImportSource>,
    pub(crate) usage_count: u32,
}

impl ImportedBuffer {
    pub(crate) fn new(source: Box<dyn ImportSource>) -> Self {
        ImportedBuffer {
            source,
            usage_count: 0,
        }
    }
}

impl Drop for ImportedBuffer {
    /// 无论经由哪条路径销毁，对外部缓冲的持有都恰好释放一次。
    fn drop(&mut self) {
        self.source.release();
    }
}

/// GPU 虚拟地址区域
pub struct VaRegion {
    pub(crate) start_vpn: Vpn,
    pub(crate) nr_pages: u32,
    pub(crate) zone: Zone,
    pub(crate) flags: RegionFlags,
    /// 缺页增长粒度（页）；只对缺页增长区域有意义
    pub(crate) extent: u32,
    /// 已提交的物理页前缀；长度即已提交页数
    pub(crate) phy_pages: Vec<Ppn>,
    pub(crate) imported: Option<ImportedBuffer>,
    /// 活跃的 CPU 映射，按用户态地址索引
    pub(crate) mappings: BTreeMap<u64, CpuMapping>,
}

impl VaRegion {
    /// 构造一个游离的空闲区域
    ///
    /// 区域尚未挂入任何跟踪器，没有物理后备。TMEM 与 EXEC zone
    /// 的区域默认可增长。
    pub(crate) fn new_free(zone: Zone, start_vpn: Vpn, nr_pages: u32) -> Self {
        debug_assert!(nr_pages > 0);
        debug_assert!(
            start_vpn.0.checked_add(nr_pages as u64).is_some(),
            "region wraps the address space"
        );

        let mut flags = RegionFlags::FREE;
        if matches!(zone, Zone::Tmem | Zone::Exec) {
            flags |= RegionFlags::GROWABLE;
        }

        VaRegion {
            start_vpn,
            nr_pages,
            zone,
            flags,
            extent: 0,
            phy_pages: Vec::new(),
            imported: None,
            mappings: BTreeMap::new(),
        }
    }

    /// 区域的起始页号
    pub fn start_vpn(&self) -> Vpn {
        self.start_vpn
    }

    /// 区域的容量（页）
    pub fn nr_pages(&self) -> u32 {
        self.nr_pages
    }

    /// 已提交的物理页数
    pub fn nr_alloc_pages(&self) -> u32 {
        self.phy_pages.len() as u32
    }

    /// 区域的结束页号（不包含）
    pub fn end_vpn(&self) -> Vpn {
        Vpn(self.start_vpn.0 + self.nr_pages as u64)
    }

    /// 区域的虚拟页号区间
    pub fn range(&self) -> VpnRange {
        VpnRange::from_start_len(self.start_vpn, self.nr_pages as u64)
    }

    /// 所属 zone
    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// 当前标志
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// 缺页增长粒度（页）
    pub fn extent(&self) -> u32 {
        self.extent
    }

    /// 区域是否空闲
    pub fn is_free(&self) -> bool {
        self.flags.contains(RegionFlags::FREE)
    }

    /// 是否存在活跃的 CPU 映射
    pub fn has_mappings(&self) -> bool {
        !self.mappings.is_empty()
    }

    /// 导入缓冲是否处于活跃使用状态
    pub fn is_actively_imported(&self) -> bool {
        self.imported.as_ref().is_some_and(|i| i.usage_count > 0)
    }

    /// 已提交的物理页列表
    pub fn phy_pages(&self) -> &[Ppn] {
        &self.phy_pages
    }

    /// 按分配请求填写区域属性位
    pub(crate) fn apply_alloc_flags(&mut self, req: GpuMemFlags, is_growable: bool) {
        // 缓存策略：GPU 侧默认启用缓存，CPU 侧由请求显式开启
        self.flags |= RegionFlags::GPU_CACHED;
        if req.contains(GpuMemFlags::CACHED_CPU) {
            self.flags |= RegionFlags::CPU_CACHED;
        }

        if req.contains(GpuMemFlags::GROW_ON_GPF) || is_growable {
            self.flags |= RegionFlags::GROWABLE;
            if req.contains(GpuMemFlags::GROW_ON_GPF) {
                self.flags |= RegionFlags::GROW_ON_PF;
            }
        } else {
            // 所在 zone 默认可增长，这里显式清除
            self.flags.remove(RegionFlags::GROWABLE);
        }

        if req.contains(GpuMemFlags::PROT_CPU_WR) {
            self.flags |= RegionFlags::CPU_WR;
        }
        if req.contains(GpuMemFlags::PROT_CPU_RD) {
            self.flags |= RegionFlags::CPU_RD;
        }
        if req.contains(GpuMemFlags::PROT_GPU_WR) {
            self.flags |= RegionFlags::GPU_WR;
        }
        if req.contains(GpuMemFlags::PROT_GPU_RD) {
            self.flags |= RegionFlags::GPU_RD;
        }
        if !req.contains(GpuMemFlags::PROT_GPU_EX) {
            self.flags |= RegionFlags::GPU_NX;
        }

        if req.contains(GpuMemFlags::COHERENT_LOCAL) {
            self.flags |= RegionFlags::SHARE_LOCAL;
        } else if req.contains(GpuMemFlags::COHERENT_SYSTEM) {
            self.flags |= RegionFlags::SHARE_SYSTEM;
        }
    }

    /// 登记一个 CPU 映射
    pub(crate) fn add_mapping(&mut self, map: CpuMapping) -> GvmResult<()> {
        if self.mappings.contains_key(&map.uaddr) {
            return Err(GvmError::InvalidArguments);
        }
        self.mappings.insert(map.uaddr, map);
        Ok(())
    }

    /// 按用户态地址注销一个 CPU 映射
    pub(crate) fn remove_mapping(&mut self, uaddr: u64) -> Option<CpuMapping> {
        self.mappings.remove(&uaddr)
    }

    /// 查找完整覆盖 `[uaddr, uaddr + size)` 的 CPU 映射
    pub(crate) fn find_enclosing_mapping(&self, uaddr: u64, size: usize) -> Option<&CpuMapping> {
        // 回绕检查
        let end = uaddr.checked_add(size as u64)?;

        self.mappings.values().find(|map| {
            let map_end = map.uaddr + ((map.nr_pages as u64) << PAGE_SHIFT);
            map.uaddr <= uaddr && end <= map_end
        })
    }
}
