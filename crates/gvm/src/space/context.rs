//! GPU 上下文与入口操作
//!
//! [`Context`] 聚合一个 GPU 执行上下文私有的全部虚拟内存状态：
//! 区域跟踪器、注入的页表/物理页/缓存协作者，以及上下文级页
//! 配额。对外的操作以字节地址（GPU 虚拟地址）为句柄。
//!
//! # 锁
//!
//! 所有区域与 resize 操作在上下文的 vm 锁内完成；锁不可重入，
//! 获取方可能阻塞。页配额计数器是无锁原子量，可在锁外读取。
//!
//! # 释放协议
//!
//! free 是请求而非保证：仍被 CPU 映射、或导入缓冲处于活跃使用
//! 状态的区域只会被标记 DELAYED_FREE；真正的销毁发生在最后一
//! 个映射移除或最后一个导入引用释放时，入口唯一。

use alloc::boxed::Box;
use alloc::sync::Arc;

use sync::SpinLock;
use uapi::{GpuImportKind, GpuMemFlags};

use crate::address::{PAGE_SIZE, Vpn};
use crate::device::{Device, HwWorkarounds};
use crate::error::{GvmError, GvmResult};
use crate::import::ImportSource;
use crate::ops::{GpuCacheOps, GpuMmuOps, PhysPageSupplier, SyncDirection};
use crate::phys;
use crate::region::{CpuMapping, ImportedBuffer, RegionFlags, VaRegion, Zone};
use crate::space::tracker::{RegionId, RegionTracker};
use crate::usage::UsageCounter;

/// vm 锁保护的上下文地址空间状态
struct VmSpace {
    tracker: RegionTracker,
    mmu: Box<dyn GpuMmuOps>,
    pages: Box<dyn PhysPageSupplier>,
    cache: Box<dyn GpuCacheOps>,
    dev: Arc<Device>,
    /// 上下文级页配额（与 [`Context`] 持有的是同一实例）
    usage: Arc<UsageCounter>,
}

/// GPU 执行上下文
pub struct Context {
    dev: Arc<Device>,
    usage: Arc<UsageCounter>,
    vm: SpinLock<VmSpace>,
}

/// 区域快照（诊断与测试用）
#[derive(Debug, Clone, Copy)]
pub struct RegionInfo {
    /// 区域起始 GPU 虚拟地址
    pub start_addr: u64,
    /// 容量（页）
    pub nr_pages: u32,
    /// 已提交页数
    pub nr_alloc_pages: u32,
    /// 所属 zone
    pub zone: Zone,
    /// 当前标志
    pub flags: RegionFlags,
    /// 缺页增长粒度（页）
    pub extent: u32,
}

impl Context {
    /// 创建上下文并建立初始地址空间
    ///
    /// 每个 zone 插入一个覆盖全区的空闲区域。max_pages 是该
    /// 上下文的页配额上限；协作者实现由设备侧代码注入。
    pub fn new(
        dev: Arc<Device>,
        max_pages: u32,
        mmu: Box<dyn GpuMmuOps>,
        pages: Box<dyn PhysPageSupplier>,
        cache: Box<dyn GpuCacheOps>,
    ) -> Self {
        let usage = Arc::new(UsageCounter::new(max_pages));

        let mut tracker = RegionTracker::new();
        for (zone, base, nr_pages) in dev.layout().zones() {
            tracker.insert(VaRegion::new_free(zone, base, nr_pages));
        }

        Context {
            dev: Arc::clone(&dev),
            usage: Arc::clone(&usage),
            vm: SpinLock::new(VmSpace {
                tracker,
                mmu,
                pages,
                cache,
                dev,
                usage,
            }),
        }
    }

    /// 所属设备
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// 上下文当前已用页数
    pub fn used_pages(&self) -> u32 {
        self.usage.current()
    }

    /// 分配一段 GPU 内存
    ///
    /// zone 由标志决定：请求可执行则落入 EXEC，否则 TMEM。
    /// vsize 是虚拟容量，psize 是初始提交页数，extent 是缺页
    /// 增长粒度（只在 `GROW_ON_GPF` 下有意义）。缺页增长内存的
    /// 三个尺寸都会按硬件增长块向上取整。
    ///
    /// 成功返回区域的起始 GPU 虚拟地址。
    pub fn alloc(
        &self,
        vsize: u32,
        psize: u32,
        extent: u32,
        flags: GpuMemFlags,
        is_growable: bool,
    ) -> GvmResult<u64> {
        if vsize == 0 || !flags.is_valid_alloc_request() {
            return Err(GvmError::InvalidArguments);
        }
        if extent > 0 && !flags.contains(GpuMemFlags::GROW_ON_GPF) {
            log::warn!("extent set on an allocation that does not grow on page fault");
            return Err(GvmError::InvalidArguments);
        }
        // 不可增长的区域只接受一次性的完整提交
        if !is_growable && !flags.contains(GpuMemFlags::GROW_ON_GPF) && psize != vsize {
            return Err(GvmError::InvalidArguments);
        }

        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let (vsize, psize, extent) = if flags.contains(GpuMemFlags::GROW_ON_GPF) {
            // 缺页增长内存的各尺寸按硬件增长块向上取整
            let v = vm.dev.round_growable_size(vsize).ok_or(GvmError::InvalidArguments)?;
            let p = vm.dev.round_growable_size(psize).ok_or(GvmError::InvalidArguments)?;
            let e = vm.dev.round_growable_size(extent).ok_or(GvmError::InvalidArguments)?;
            (v, p, e)
        } else {
            (vsize, psize, extent)
        };

        let zone = if flags.contains(GpuMemFlags::PROT_GPU_EX) {
            Zone::Exec
        } else {
            Zone::Tmem
        };

        let mut reg = VaRegion::new_free(zone, Vpn(0), vsize);
        reg.flags.remove(RegionFlags::FREE);
        reg.apply_alloc_flags(flags, is_growable);
        reg.extent = extent;

        let id = vm.tracker.add(reg, None, vsize, 1)?;
        Self::back_and_install(vm, id, vsize, psize)?;
        Ok(vm.tracker.get(id).start_vpn().start_addr())
    }

    /// 在指定地址分配一段完整提交的 GPU 内存
    ///
    /// 地址必须页对齐并落在某个 zone 内。用于需要固定布局的
    /// 常驻分配（典型地在 PMEM zone）。
    pub fn alloc_fixed(&self, gpu_addr: u64, nr_pages: u32, flags: GpuMemFlags) -> GvmResult<u64> {
        if gpu_addr == 0 || gpu_addr & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(GvmError::InvalidArguments);
        }
        if nr_pages == 0 || !flags.is_valid_alloc_request() {
            return Err(GvmError::InvalidArguments);
        }
        // 固定地址分配总是完整提交，不支持缺页增长
        if flags.contains(GpuMemFlags::GROW_ON_GPF) {
            return Err(GvmError::InvalidArguments);
        }

        let vpn = Vpn::from_addr_floor(gpu_addr);

        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let zone = vm.dev.layout().zone_of(vpn).ok_or(GvmError::OutOfGpuMemory)?;

        let mut reg = VaRegion::new_free(zone, Vpn(0), nr_pages);
        reg.flags.remove(RegionFlags::FREE);
        reg.apply_alloc_flags(flags, false);

        let id = vm.tracker.add(reg, Some(vpn), nr_pages, 1)?;
        Self::back_and_install(vm, id, nr_pages, nr_pages)?;
        Ok(gpu_addr)
    }

    /// 释放一段 GPU 内存
    ///
    /// 这是一个请求：存在外部引用时区域被标记 DELAYED_FREE 并
    /// 返回成功，销毁推迟到最后一个引用消失。
    pub fn free(&self, gpu_addr: u64) -> GvmResult<()> {
        if gpu_addr == 0 {
            log::warn!("gpu_addr 0 is reserved, refusing to free it");
            return Err(GvmError::Failed);
        }

        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let Some(id) = vm.tracker.find_base_address(Vpn::from_addr_floor(gpu_addr)) else {
            log::warn!("trying to free nonexistent region {:#x}", gpu_addr);
            return Err(GvmError::Failed);
        };
        if vm.tracker.get(id).is_free() {
            log::warn!("trying to free a free region {:#x}", gpu_addr);
            return Err(GvmError::Failed);
        }

        Self::free_region_locked(vm, id)
    }

    /// 按相对增量调整可增长区域的已提交页数
    ///
    /// 缺页增长区域的增量先按硬件增长块量化（增长向上、收缩
    /// 向下取整）。零增量只做查询。成功返回新的已提交页数。
    pub fn resize_by(&self, gpu_addr: u64, delta: i64) -> GvmResult<u32> {
        if gpu_addr == 0 {
            return Err(GvmError::InvalidArguments);
        }

        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = Self::find_growable_locked(vm, gpu_addr)?;
        if delta != 0 && vm.tracker.get(id).has_mappings() {
            return Err(GvmError::Mapped);
        }

        let mut delta = delta;
        if vm.tracker.get(id).flags().contains(RegionFlags::GROW_ON_PF) {
            // 量化可能把一个较小的负增量变成零
            delta = vm
                .dev
                .round_growable_delta(delta)
                .ok_or(GvmError::InvalidArguments)?;
        }

        let committed = vm.tracker.get(id).nr_alloc_pages() as i64;
        let capacity = vm.tracker.get(id).nr_pages() as i64;
        let target = committed.checked_add(delta).ok_or(GvmError::InvalidArguments)?;
        if target < 0 || target > capacity {
            return Err(GvmError::InvalidArguments);
        }

        if delta > 0 {
            Self::grow_locked(vm, id, delta as u32)?;
        } else if delta < 0 {
            Self::shrink_locked(vm, id, delta.unsigned_abs() as u32)?;
        }
        // delta == 0：纯查询

        Ok(vm.tracker.get(id).nr_alloc_pages())
    }

    /// 把可增长区域的已提交页数调整到绝对值
    ///
    /// 目标与当前值相等（量化后）时总是成功，即使区域被映射。
    /// 成功返回新的已提交页数。
    pub fn set_size(&self, gpu_addr: u64, size: u32) -> GvmResult<u32> {
        if gpu_addr == 0 {
            return Err(GvmError::InvalidArguments);
        }

        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = Self::find_growable_locked(vm, gpu_addr)?;

        let mut size = size;
        if size != 0 && vm.tracker.get(id).flags().contains(RegionFlags::GROW_ON_PF) {
            size = vm
                .dev
                .round_growable_size(size)
                .ok_or(GvmError::InvalidArguments)?;
        }
        if size > vm.tracker.get(id).nr_pages() {
            return Err(GvmError::InvalidArguments);
        }

        let committed = vm.tracker.get(id).nr_alloc_pages();
        if size != committed && vm.tracker.get(id).has_mappings() {
            return Err(GvmError::Mapped);
        }

        if size > committed {
            Self::grow_locked(vm, id, size - committed)?;
        } else if size < committed {
            Self::shrink_locked(vm, id, committed - size)?;
        }

        Ok(vm.tracker.get(id).nr_alloc_pages())
    }

    /// 查询区域当前的已提交页数
    pub fn get_size(&self, gpu_addr: u64) -> GvmResult<u32> {
        if gpu_addr == 0 {
            return Err(GvmError::Failed);
        }
        let guard = self.vm.lock();
        let id = guard
            .tracker
            .find_base_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::Failed)?;
        let reg = guard.tracker.get(id);
        if reg.is_free() {
            return Err(GvmError::Failed);
        }
        Ok(reg.nr_alloc_pages())
    }

    /// 导入一个外部缓冲为 GPU 可见的区域
    ///
    /// 区域落入 TMEM zone，容量等于缓冲页数且立即视为完整提交；
    /// 不可增长、不可执行。物理页由外部来源持有，本地配额不
    /// 参与核算。成功返回（起始 GPU 虚拟地址, 页数）。
    pub fn import(&self, source: Box<dyn ImportSource>) -> GvmResult<(u64, u64)> {
        let mut imp = ImportedBuffer::new(source);

        // 任何失败路径上 imp 的析构都会释放外部引用
        let info = imp.source.resolve()?;
        if info.pages.is_empty() || info.pages.len() > u32::MAX as usize {
            return Err(GvmError::InvalidArguments);
        }
        let nr_pages = info.pages.len() as u32;
        let kind = imp.source.kind();

        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let mut reg = VaRegion::new_free(Zone::Tmem, Vpn(0), nr_pages);
        reg.flags.remove(RegionFlags::FREE);
        // 导入内存一律不可执行、不可增长
        reg.flags |= RegionFlags::GPU_NX;
        reg.flags.remove(RegionFlags::GROWABLE);
        reg.flags |= info.access
            & (RegionFlags::CPU_RD
                | RegionFlags::CPU_WR
                | RegionFlags::GPU_RD
                | RegionFlags::GPU_WR
                | RegionFlags::CPU_CACHED
                | RegionFlags::GPU_CACHED
                | RegionFlags::SHARE_LOCAL
                | RegionFlags::SHARE_SYSTEM);
        if kind == GpuImportKind::DmaBuf {
            reg.flags |= RegionFlags::GPU_CACHED;
        }
        reg.phy_pages = info.pages;
        reg.extent = nr_pages;
        reg.imported = Some(imp);

        let id = vm.tracker.add(reg, None, nr_pages, 1)?;

        if kind == GpuImportKind::SharedAlloc {
            // 共享分配器的页已常驻，立即安装；
            // 外部缓冲对象要等附着后才由使用方安装
            let r = vm.tracker.get(id);
            if let Err(e) = vm.mmu.install_pages(r.start_vpn(), r.phy_pages(), r.flags()) {
                log::warn!("failed to map imported pages on the GPU");
                let _ = vm.tracker.remove(id);
                return Err(e);
            }
        }

        Ok((vm.tracker.get(id).start_vpn().start_addr(), nr_pages as u64))
    }

    /// 增加导入缓冲的活跃引用
    ///
    /// 第一个引用出现时通知来源附着。
    pub fn import_retain(&self, gpu_addr: u64) -> GvmResult<()> {
        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = vm
            .tracker
            .find_base_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::InvalidArguments)?;
        let reg = vm.tracker.get_mut(id);
        let imp = reg.imported.as_mut().ok_or(GvmError::InvalidArguments)?;

        if imp.usage_count == 0 {
            imp.source.attach()?;
        }
        imp.usage_count += 1;
        Ok(())
    }

    /// 释放导入缓冲的一个活跃引用
    ///
    /// 最后一个引用消失时通知来源脱离；此时如果区域已被请求
    /// 释放且没有 CPU 映射，就补完被推迟的销毁。
    pub fn import_release(&self, gpu_addr: u64) -> GvmResult<()> {
        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = vm
            .tracker
            .find_base_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::InvalidArguments)?;
        let reg = vm.tracker.get_mut(id);
        let Some(imp) = reg.imported.as_mut() else {
            return Err(GvmError::InvalidArguments);
        };
        if imp.usage_count == 0 {
            return Err(GvmError::InvalidArguments);
        }

        imp.usage_count -= 1;
        let now_idle = imp.usage_count == 0;
        if now_idle {
            imp.source.detach();
        }

        let pending = now_idle
            && reg.flags().contains(RegionFlags::DELAYED_FREE)
            && !reg.has_mappings();
        if pending {
            return Self::destroy_region_locked(vm, id);
        }
        Ok(())
    }

    /// 更新 TMEM 区域的一致性属性
    ///
    /// 目前只支持导入内存：共享分配器导入立即下发页表更新；
    /// 外部缓冲对象只有处于附着状态才下发，否则先记录待附着
    /// 时生效。页表更新失败时属性回滚。
    pub fn set_attributes(&self, gpu_addr: u64, attrs: GpuMemFlags) -> GvmResult<()> {
        if gpu_addr == 0 {
            return Err(GvmError::Failed);
        }

        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = vm
            .tracker
            .find_base_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::Failed)?;
        let reg = vm.tracker.get_mut(id);
        if reg.is_free() || reg.zone() != Zone::Tmem {
            return Err(GvmError::Failed);
        }

        let mut requested = RegionFlags::empty();
        if attrs.contains(GpuMemFlags::COHERENT_SYSTEM) {
            requested |= RegionFlags::SHARE_SYSTEM;
        } else if attrs.contains(GpuMemFlags::COHERENT_LOCAL) {
            requested |= RegionFlags::SHARE_LOCAL;
        }

        let share_mask = RegionFlags::SHARE_SYSTEM | RegionFlags::SHARE_LOCAL;
        if requested == reg.flags() & share_mask {
            // 没有要更新的内容
            return Ok(());
        }

        let prev = reg.flags();
        reg.flags = (reg.flags - share_mask) | requested;

        let result = match reg.imported.as_ref() {
            Some(imp) => match imp.source.kind() {
                GpuImportKind::SharedAlloc => {
                    vm.mmu.update_pages(reg.start_vpn, &reg.phy_pages, reg.flags)
                }
                GpuImportKind::DmaBuf => {
                    if imp.usage_count > 0 {
                        // 附着期间使用方持有读写权限
                        vm.mmu.update_pages(
                            reg.start_vpn,
                            &reg.phy_pages,
                            reg.flags | RegionFlags::GPU_WR | RegionFlags::GPU_RD,
                        )
                    } else {
                        Ok(())
                    }
                }
            },
            // 目前只支持导入内存的属性更新
            None => Err(GvmError::Failed),
        };

        if result.is_err() {
            // 页表更新失败，恢复原属性
            reg.flags = prev;
        }
        result
    }

    /// 查询 TMEM 区域的一致性/访问属性
    ///
    /// 只有导入内存携带这些属性；其余区域返回空集。
    pub fn get_attributes(&self, gpu_addr: u64) -> GvmResult<GpuMemFlags> {
        if gpu_addr == 0 {
            return Err(GvmError::Failed);
        }

        let guard = self.vm.lock();
        let id = guard
            .tracker
            .find_base_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::Failed)?;
        let reg = guard.tracker.get(id);
        if reg.is_free() || reg.zone() != Zone::Tmem {
            return Err(GvmError::Failed);
        }

        let mut attrs = GpuMemFlags::empty();
        if reg.imported.is_some() {
            let flags = reg.flags();
            if flags.contains(RegionFlags::GPU_WR) {
                attrs |= GpuMemFlags::PROT_GPU_WR;
            }
            if flags.contains(RegionFlags::GPU_RD) {
                attrs |= GpuMemFlags::PROT_GPU_RD;
            }
            if !flags.contains(RegionFlags::GPU_NX) {
                attrs |= GpuMemFlags::PROT_GPU_EX;
            }
            if flags.contains(RegionFlags::SHARE_SYSTEM) {
                attrs |= GpuMemFlags::COHERENT_SYSTEM;
            }
            if flags.contains(RegionFlags::SHARE_LOCAL) {
                attrs |= GpuMemFlags::COHERENT_LOCAL;
            }
        }
        Ok(attrs)
    }

    /// 登记一个用户态 CPU 映射
    ///
    /// 由外部的映射建立路径调用。映射必须完整落在区域已提交的
    /// 范围内；已被请求释放的区域不接受新映射。
    pub fn add_cpu_mapping(
        &self,
        gpu_addr: u64,
        uaddr: u64,
        nr_pages: u32,
        page_off: u64,
    ) -> GvmResult<()> {
        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = vm
            .tracker
            .find_enclosing_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::InvalidArguments)?;
        let reg = vm.tracker.get_mut(id);
        if reg.is_free() || reg.flags().contains(RegionFlags::DELAYED_FREE) {
            return Err(GvmError::InvalidArguments);
        }
        let map_end = page_off
            .checked_add(nr_pages as u64)
            .ok_or(GvmError::InvalidArguments)?;
        if map_end > reg.nr_alloc_pages() as u64 {
            return Err(GvmError::InvalidArguments);
        }

        reg.add_mapping(CpuMapping {
            uaddr,
            nr_pages,
            page_off,
        })
    }

    /// 注销一个用户态 CPU 映射
    ///
    /// 由外部的解除映射路径调用。最后一个映射消失时补完被
    /// 推迟的销毁。
    pub fn remove_cpu_mapping(&self, gpu_addr: u64, uaddr: u64) -> GvmResult<()> {
        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = vm
            .tracker
            .find_enclosing_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::Failed)?;
        let reg = vm.tracker.get_mut(id);
        if reg.remove_mapping(uaddr).is_none() {
            log::warn!(
                "freeing unknown mapping {:#x} in region {:#x}",
                uaddr,
                reg.start_vpn().start_addr()
            );
            return Err(GvmError::Failed);
        }

        let pending = reg.flags().contains(RegionFlags::DELAYED_FREE) && !reg.has_mappings();
        if pending {
            // 最后一个映射消失，补完被推迟的销毁
            // （free_region_locked 会重新检查导入引用）
            return Self::free_region_locked(vm, id);
        }
        Ok(())
    }

    /// 查找完整覆盖 `[uaddr, uaddr + size)` 的 CPU 映射
    pub fn find_enclosing_cpu_mapping(
        &self,
        gpu_addr: u64,
        uaddr: u64,
        size: usize,
    ) -> Option<CpuMapping> {
        let guard = self.vm.lock();
        let id = guard
            .tracker
            .find_enclosing_address(Vpn::from_addr_floor(gpu_addr))?;
        guard
            .tracker
            .get(id)
            .find_enclosing_mapping(uaddr, size)
            .copied()
    }

    /// 对一段已映射内存执行缓存同步
    ///
    /// 只对 CPU 侧启用缓存的区域有事可做。把用户区间翻译成
    /// 物理页，按物理连续段聚合后逐段交给缓存协作者。
    pub fn sync_range(
        &self,
        gpu_addr: u64,
        uaddr: u64,
        size: usize,
        dir: SyncDirection,
    ) -> GvmResult<()> {
        let mut guard = self.vm.lock();
        let vm = &mut *guard;

        let id = vm
            .tracker
            .find_enclosing_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::Failed)?;
        let reg = vm.tracker.get(id);

        if !reg.flags().contains(RegionFlags::CPU_CACHED) {
            return Ok(());
        }

        let map = *reg
            .find_enclosing_mapping(uaddr, size)
            .ok_or(GvmError::Failed)?;

        let mut addr = uaddr;
        let mut remaining = size;
        let mut page_idx = (map.page_off + ((addr - map.uaddr) >> crate::address::PAGE_SHIFT)) as usize;

        // 把物理上连续的页聚合成段，逐段下发
        let mut run_paddr: u64 = 0;
        let mut run_len: usize = 0;
        while remaining > 0 {
            debug_assert!(page_idx < reg.phy_pages().len());
            let offset = (addr as usize) & (PAGE_SIZE - 1);
            let chunk = core::cmp::min(PAGE_SIZE - offset, remaining);
            let paddr = reg.phy_pages()[page_idx].start_addr() + offset as u64;

            if run_len > 0 && paddr == run_paddr + run_len as u64 {
                run_len += chunk;
            } else {
                if run_len > 0 {
                    vm.cache.sync_range(run_paddr, run_len, dir);
                }
                run_paddr = paddr;
                run_len = chunk;
            }

            addr += chunk as u64;
            remaining -= chunk;
            page_idx += 1;
        }
        if run_len > 0 {
            vm.cache.sync_range(run_paddr, run_len, dir);
        }
        Ok(())
    }

    /// 包含给定地址的区域快照
    pub fn region_info(&self, gpu_addr: u64) -> Option<RegionInfo> {
        let guard = self.vm.lock();
        let id = guard
            .tracker
            .find_enclosing_address(Vpn::from_addr_floor(gpu_addr))?;
        let reg = guard.tracker.get(id);
        Some(RegionInfo {
            start_addr: reg.start_vpn().start_addr(),
            nr_pages: reg.nr_pages(),
            nr_alloc_pages: reg.nr_alloc_pages(),
            zone: reg.zone(),
            flags: reg.flags(),
            extent: reg.extent(),
        })
    }

    /// 校验目标是一个可 resize 的区域，返回其句柄
    fn find_growable_locked(vm: &VmSpace, gpu_addr: u64) -> GvmResult<RegionId> {
        let id = vm
            .tracker
            .find_base_address(Vpn::from_addr_floor(gpu_addr))
            .ok_or(GvmError::InvalidArguments)?;
        let reg = vm.tracker.get(id);
        if reg.is_free() {
            return Err(GvmError::InvalidArguments);
        }
        if !matches!(reg.zone(), Zone::Tmem | Zone::Exec) {
            return Err(GvmError::InvalidArguments);
        }
        if !reg.flags().contains(RegionFlags::GROWABLE) {
            return Err(GvmError::NotGrowable);
        }
        Ok(id)
    }

    /// 提交区域后备并安装已提交前缀，失败时把区间还给跟踪器
    fn back_and_install(vm: &mut VmSpace, id: RegionId, vsize: u32, psize: u32) -> GvmResult<()> {
        let VmSpace {
            tracker,
            mmu,
            pages,
            dev,
            usage,
            ..
        } = vm;

        if let Err(e) = phys::alloc_backing(
            tracker.get_mut(id),
            pages.as_ref(),
            usage,
            dev.usage(),
            vsize,
            psize,
        ) {
            let _ = tracker.remove(id);
            return Err(e);
        }

        let r = tracker.get(id);
        if let Err(e) = mmu.install_pages(r.start_vpn(), r.phy_pages(), r.flags()) {
            log::warn!("failed to map allocation on the GPU");
            let mut reg = tracker.remove(id);
            phys::free_phy_pages(&mut reg, pages.as_ref(), usage, dev.usage());
            return Err(e);
        }
        Ok(())
    }

    /// 在区域尾部提交并安装 nr_pages 个新页
    fn grow_locked(vm: &mut VmSpace, id: RegionId, nr_pages: u32) -> GvmResult<()> {
        let VmSpace {
            tracker,
            mmu,
            pages,
            dev,
            usage,
            ..
        } = vm;

        let reg = tracker.get_mut(id);
        let old = reg.nr_alloc_pages();
        phys::commit_pages(reg, pages.as_ref(), usage, dev.usage(), nr_pages)?;

        if mmu
            .install_pages(
                reg.start_vpn().add(old as u64),
                &reg.phy_pages()[old as usize..],
                reg.flags(),
            )
            .is_err()
        {
            // 安装失败：已提交的页与配额全部回滚
            phys::release_pages(reg, pages.as_ref(), usage, dev.usage(), nr_pages);
            return Err(GvmError::OutOfMemory);
        }
        Ok(())
    }

    /// 从区域尾部拆除并归还 nr_pages 个页
    fn shrink_locked(vm: &mut VmSpace, id: RegionId, nr_pages: u32) -> GvmResult<()> {
        let VmSpace {
            tracker,
            mmu,
            pages,
            cache,
            dev,
            usage,
        } = vm;

        let reg = tracker.get_mut(id);
        let keep = reg.nr_alloc_pages() - nr_pages;

        // 先从页表拆除，成功后才能归还物理页；顺序不可交换
        mmu.teardown_pages(reg.start_vpn().add(keep as u64), nr_pages)
            .map_err(|_| GvmError::OutOfMemory)?;

        if dev
            .workarounds()
            .contains(HwWorkarounds::WRITE_FLUSH_BEFORE_FREE)
        {
            // 归还物理页前等待 GPU 写缓冲回刷
            cache.wait_gpu_write_flush();
        }

        phys::release_pages(reg, pages.as_ref(), usage, dev.usage(), nr_pages);
        Ok(())
    }

    /// 释放请求的受理：有外部引用则标记推迟，否则立即销毁
    fn free_region_locked(vm: &mut VmSpace, id: RegionId) -> GvmResult<()> {
        let reg = vm.tracker.get_mut(id);
        if reg.has_mappings() || reg.is_actively_imported() {
            // 仍有外部引用：只做标记，等引用消失时再销毁
            reg.flags |= RegionFlags::DELAYED_FREE;
            return Ok(());
        }
        Self::destroy_region_locked(vm, id)
    }

    /// 真正销毁一个区域：拆页表、归还区间、释放物理后备
    fn destroy_region_locked(vm: &mut VmSpace, id: RegionId) -> GvmResult<()> {
        let VmSpace {
            tracker,
            mmu,
            pages,
            cache,
            dev,
            usage,
        } = vm;

        {
            let reg = tracker.get(id);
            mmu.teardown_pages(reg.start_vpn(), reg.nr_alloc_pages())
                .inspect_err(|_| log::warn!("could not unmap region from the GPU"))?;
        }

        let mut reg = tracker.remove(id);

        if dev
            .workarounds()
            .contains(HwWorkarounds::WRITE_FLUSH_BEFORE_FREE)
        {
            // 物理页归还前等待 GPU 写缓冲回刷
            cache.wait_gpu_write_flush();
        }

        phys::free_phy_pages(&mut reg, pages.as_ref(), usage, dev.usage());
        debug_assert!(!reg.has_mappings());
        Ok(())
    }
}

impl Drop for VmSpace {
    /// 上下文销毁：回收所有区域，释放一切残留的物理后备。
    fn drop(&mut self) {
        while let Some(mut reg) = self.tracker.take_first() {
            if !reg.is_free() {
                phys::free_phy_pages(&mut reg, self.pages.as_ref(), &self.usage, self.dev.usage());
            }
        }
        debug_assert_eq!(self.usage.current(), 0, "context pages leaked at teardown");
    }
}
