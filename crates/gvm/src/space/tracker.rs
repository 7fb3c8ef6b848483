//! 区域跟踪器
//!
//! 每个上下文用一个按 `start_vpn` 排序的结构管理其全部区域
//! （空闲与已分配）。区域对象保存在 arena 中，由稳定的
//! [`RegionId`] 句柄引用；有序索引是 start_vpn → RegionId 的
//! BTreeMap。三条不变式贯穿所有变更：
//!
//! - 任意两个区域的区间互不重叠，且每个 zone 被区域完整平铺；
//! - 不存在相邻且同 zone 的两个空闲区域（remove 时合并）；
//! - 键字段 start_vpn 变化时先摘除索引项再重插，绝不原地修改
//!   已入索引的键。

use alloc::collections::btree_map::BTreeMap;
use alloc::vec::Vec;

use crate::address::{Vpn, VpnRange};
use crate::error::{GvmError, GvmResult};
use crate::region::{VaRegion, Zone};

/// 区域句柄
///
/// 在区域离开跟踪器（销毁或合并）之前保持有效；此后的解引用
/// 属于编程错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionId(u32);

/// 每上下文的区域跟踪器
pub struct RegionTracker {
    slots: Vec<Option<VaRegion>>,
    free_slots: Vec<u32>,
    by_start: BTreeMap<Vpn, RegionId>,
}

impl RegionTracker {
    /// 创建空的跟踪器
    pub(crate) fn new() -> Self {
        RegionTracker {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_start: BTreeMap::new(),
        }
    }

    fn alloc_slot(&mut self, reg: VaRegion) -> RegionId {
        if let Some(idx) = self.free_slots.pop() {
            self.slots[idx as usize] = Some(reg);
            RegionId(idx)
        } else {
            self.slots.push(Some(reg));
            RegionId((self.slots.len() - 1) as u32)
        }
    }

    fn take_slot(&mut self, id: RegionId) -> VaRegion {
        let reg = self.slots[id.0 as usize]
            .take()
            .expect("stale region handle");
        self.free_slots.push(id.0);
        reg
    }

    /// 取句柄对应的区域
    ///
    /// # Panics
    /// 句柄已失效时 panic（编程错误）。
    pub fn get(&self, id: RegionId) -> &VaRegion {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale region handle")
    }

    pub(crate) fn get_mut(&mut self, id: RegionId) -> &mut VaRegion {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale region handle")
    }

    /// 插入一个游离区域
    ///
    /// 调用方保证与现有区域不重叠（debug 构建下检查，违反属于
    /// 编程错误而非运行时错误）。
    pub(crate) fn insert(&mut self, reg: VaRegion) -> RegionId {
        let start = reg.start_vpn();
        debug_assert!(!self.by_start.contains_key(&start));
        #[cfg(debug_assertions)]
        {
            let range = reg.range();
            if let Some((_, &prev)) = self.by_start.range(..start).next_back() {
                debug_assert!(!self.get(prev).range().overlaps(&range), "regions overlap");
            }
            if let Some((_, &next)) = self.by_start.range(start..).next() {
                debug_assert!(!self.get(next).range().overlaps(&range), "regions overlap");
            }
        }

        let id = self.alloc_slot(reg);
        self.by_start.insert(start, id);
        id
    }

    /// 查找包含给定页号的区域（按容量边界）
    pub fn find_enclosing_address(&self, vpn: Vpn) -> Option<RegionId> {
        let (_, &id) = self.by_start.range(..=vpn).next_back()?;
        (vpn < self.get(id).end_vpn()).then_some(id)
    }

    /// 查找起始页号恰好等于给定值的区域
    ///
    /// 用于校验调用方提供的区域句柄。
    pub fn find_base_address(&self, vpn: Vpn) -> Option<RegionId> {
        self.by_start.get(&vpn).copied()
    }

    /// 查找已提交范围完整包含给定区间的区域
    pub fn find_enclosing_range(&self, range: VpnRange) -> Option<RegionId> {
        let (_, &id) = self.by_start.range(..=range.start).next_back()?;
        let reg = self.get(id);
        let committed_end = Vpn(reg.start_vpn().0 + reg.nr_alloc_pages() as u64);
        (range.start >= reg.start_vpn() && range.end <= committed_end).then_some(id)
    }

    /// 查找容量范围完整包含给定区间的区域
    ///
    /// 只看区间边界，FREE 标志与 zone 由调用方检查。
    pub fn find_enclosing_range_free(&self, range: VpnRange) -> Option<RegionId> {
        let (_, &id) = self.by_start.range(..=range.start).next_back()?;
        let reg = self.get(id);
        (range.start >= reg.start_vpn() && range.end <= reg.end_vpn()).then_some(id)
    }

    /// 首次适配：按地址升序找到第一个能容纳请求的空闲区域
    ///
    /// 线性扫描，不做最佳适配。align 必须是 2 的幂。
    pub fn find_first_fit(&self, zone: Zone, nr_pages: u32, align: u32) -> Option<RegionId> {
        for &id in self.by_start.values() {
            let reg = self.get(id);
            if reg.nr_pages() >= nr_pages && reg.is_free() && reg.zone() == zone {
                // 对齐后的起点必须仍落在区域内，且放得下整个请求
                let start = reg.start_vpn().as_u64();
                let end = start + reg.nr_pages() as u64 - 1;
                let aligned = reg.start_vpn().align_up(align as u64).as_u64();
                if aligned >= start && aligned <= end && aligned + nr_pages as u64 - 1 <= end {
                    return Some(id);
                }
            }
        }
        None
    }

    /// 把区域挂入地址空间
    ///
    /// 指定地址时，包含整个请求区间的空闲区域必须存在、同 zone
    /// 且空闲；任意地址时按首次适配选择。被选中的空闲区域最多
    /// 拆成三段（前剩余、新区域、后剩余），剩余部分重新入索引。
    pub(crate) fn add(
        &mut self,
        reg: VaRegion,
        addr: Option<Vpn>,
        nr_pages: u32,
        align: u32,
    ) -> GvmResult<RegionId> {
        let align = if align == 0 { 1 } else { align };
        if !align.is_power_of_two() || nr_pages == 0 {
            return Err(GvmError::InvalidArguments);
        }

        match addr {
            Some(target) => {
                if target.as_u64() & (align as u64 - 1) != 0 {
                    return Err(GvmError::InvalidArguments);
                }
                let range = VpnRange::from_start_len(target, nr_pages as u64);
                let Some(host) = self.find_enclosing_range_free(range) else {
                    log::warn!(
                        "enclosing region not found: vpn {:#x}, {} pages",
                        target.as_u64(),
                        nr_pages
                    );
                    return Err(GvmError::OutOfGpuMemory);
                };
                let h = self.get(host);
                // 故意不区分"地址被占用"与"地址非法"，调用方无从补救
                if !h.is_free() || h.zone() != reg.zone() {
                    log::warn!(
                        "region at vpn {:#x} is not a free {:?} region",
                        target.as_u64(),
                        reg.zone()
                    );
                    return Err(GvmError::OutOfGpuMemory);
                }
                Ok(self.carve(host, reg, target, nr_pages))
            }
            None => {
                let Some(host) = self.find_first_fit(reg.zone(), nr_pages, align) else {
                    return Err(GvmError::OutOfGpuMemory);
                };
                let start = self.get(host).start_vpn().align_up(align as u64);
                Ok(self.carve(host, reg, start, nr_pages))
            }
        }
    }

    /// 在空闲区域 host 内放置 reg，剩余部分重新入索引
    fn carve(&mut self, host: RegionId, mut reg: VaRegion, start: Vpn, nr_pages: u32) -> RegionId {
        let (h_start, h_pages, h_zone) = {
            let h = self.get(host);
            debug_assert!(h.is_free());
            (h.start_vpn(), h.nr_pages(), h.zone())
        };
        let h_end = h_start.0 + h_pages as u64;
        let r_end = start.0 + nr_pages as u64;
        debug_assert!(start >= h_start && r_end <= h_end);

        reg.start_vpn = start;
        reg.nr_pages = nr_pages;

        if h_start == start && h_pages == nr_pages {
            // 空闲区域被整块占用
            self.by_start.remove(&h_start);
            self.take_slot(host);
        } else if h_start == start {
            // 占用头部：空闲区域的键变化，先摘除再重插
            self.by_start.remove(&h_start);
            let new_key = {
                let h = self.get_mut(host);
                h.start_vpn = Vpn(r_end);
                h.nr_pages -= nr_pages;
                h.start_vpn
            };
            self.by_start.insert(new_key, host);
        } else if h_end == r_end {
            // 占用尾部：键不变，原地收缩
            self.get_mut(host).nr_pages -= nr_pages;
        } else {
            // 从中间切开：前段另立一个空闲区域
            let front = VaRegion::new_free(h_zone, h_start, (start.0 - h_start.0) as u32);
            self.by_start.remove(&h_start);
            let new_key = {
                let h = self.get_mut(host);
                h.start_vpn = Vpn(r_end);
                h.nr_pages = (h_end - r_end) as u32;
                h.start_vpn
            };
            self.by_start.insert(new_key, host);
            self.insert(front);
        }

        self.insert(reg)
    }

    /// 把区域摘出地址空间，区间合并回空闲
    ///
    /// 尽量与空闲的同 zone 前驱/后继合并（后继在前驱合并之后
    /// 重新查找）；无论是否发生合并，原区间都以单个空闲区域回
    /// 到索引。被摘出的区域返回给调用方，其物理后备原样保留。
    pub(crate) fn remove(&mut self, id: RegionId) -> VaRegion {
        let reg = self.take_slot(id);
        let removed = self.by_start.remove(&reg.start_vpn());
        debug_assert_eq!(removed, Some(id));

        let zone = reg.zone();
        let mut free_start = reg.start_vpn();
        let mut free_pages = reg.nr_pages();

        // 与前驱合并：zone 被区域完整平铺，空闲同 zone 前驱必然紧邻
        if let Some((&prev_start, &prev_id)) = self.by_start.range(..free_start).next_back() {
            let prev = self.get(prev_id);
            if prev.is_free() && prev.zone() == zone {
                debug_assert_eq!(prev.end_vpn(), free_start);
                free_pages += prev.nr_pages();
                free_start = prev_start;
                self.by_start.remove(&prev_start);
                self.take_slot(prev_id);
            }
        }

        // 与后继合并（重新查找，前一步可能已改变结构）
        if let Some((&next_start, &next_id)) = self.by_start.range(reg.start_vpn()..).next() {
            let next = self.get(next_id);
            if next.is_free() && next.zone() == zone {
                debug_assert_eq!(next_start, reg.end_vpn());
                free_pages += next.nr_pages();
                self.by_start.remove(&next_start);
                self.take_slot(next_id);
            }
        }

        self.insert(VaRegion::new_free(zone, free_start, free_pages));
        reg
    }

    /// 摘出地址最低的区域（上下文销毁时逐个回收）
    pub(crate) fn take_first(&mut self) -> Option<VaRegion> {
        let (_, id) = self.by_start.pop_first()?;
        Some(self.take_slot(id))
    }

    /// 校验跟踪器不变式（仅测试用）
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut prev: Option<(Vpn, RegionId)> = None;
        for (&start, &id) in &self.by_start {
            let reg = self.get(id);
            assert_eq!(reg.start_vpn(), start, "index key out of sync");
            if let Some((_, prev_id)) = prev {
                let p = self.get(prev_id);
                assert!(p.end_vpn() <= start, "regions overlap");
                let adjacent_free = p.is_free()
                    && reg.is_free()
                    && p.zone() == reg.zone()
                    && p.end_vpn() == start;
                assert!(!adjacent_free, "unmerged adjacent free regions");
            }
            prev = Some((start, id));
        }
    }

    /// 按地址升序给出 (句柄, 区域) 快照（仅测试用）
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<(u64, u32, bool)> {
        self.by_start
            .values()
            .map(|&id| {
                let r = self.get(id);
                (r.start_vpn().as_u64(), r.nr_pages(), r.is_free())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE_BASE: u64 = 0x1000;
    const ZONE_PAGES: u32 = 1024;

    fn tmem_tracker() -> RegionTracker {
        let mut tracker = RegionTracker::new();
        tracker.insert(VaRegion::new_free(Zone::Tmem, Vpn(ZONE_BASE), ZONE_PAGES));
        tracker
    }

    fn alloc_region(tracker: &mut RegionTracker, nr_pages: u32) -> RegionId {
        let mut reg = VaRegion::new_free(Zone::Tmem, Vpn(0), nr_pages);
        reg.flags.remove(crate::region::RegionFlags::FREE);
        let id = tracker.add(reg, None, nr_pages, 1).unwrap();
        tracker.check_invariants();
        id
    }

    fn alloc_region_at(tracker: &mut RegionTracker, at: u64, nr_pages: u32) -> GvmResult<RegionId> {
        let mut reg = VaRegion::new_free(Zone::Tmem, Vpn(0), nr_pages);
        reg.flags.remove(crate::region::RegionFlags::FREE);
        let id = tracker.add(reg, Some(Vpn(at)), nr_pages, 1)?;
        tracker.check_invariants();
        Ok(id)
    }

    #[test]
    fn test_first_fit_ascending_order() {
        let mut tracker = tmem_tracker();

        // A、B 依次从 zone 起点分配
        let a = alloc_region(&mut tracker, 100);
        assert_eq!(tracker.get(a).start_vpn().as_u64(), ZONE_BASE);
        let b = alloc_region(&mut tracker, 50);
        assert_eq!(tracker.get(b).start_vpn().as_u64(), ZONE_BASE + 100);

        // 释放 A：前面没有空闲邻居，B 已分配，空闲区域只有两段
        tracker.remove(a);
        tracker.check_invariants();
        assert_eq!(
            tracker.snapshot(),
            alloc::vec![
                (ZONE_BASE, 100, true),
                (ZONE_BASE + 100, 50, false),
                (ZONE_BASE + 150, ZONE_PAGES - 150, true),
            ]
        );

        // C 按首次适配重用最低地址的空闲段
        let c = alloc_region(&mut tracker, 100);
        assert_eq!(tracker.get(c).start_vpn().as_u64(), ZONE_BASE);
    }

    #[test]
    fn test_add_remove_round_trip() {
        let mut tracker = tmem_tracker();
        let before = tracker.snapshot();

        let id = alloc_region(&mut tracker, 64);
        tracker.remove(id);
        tracker.check_invariants();

        // 无碎片往返：空闲边界恢复原状
        assert_eq!(tracker.snapshot(), before);
    }

    #[test]
    fn test_merge_completeness() {
        let mut tracker = tmem_tracker();
        let a = alloc_region(&mut tracker, 10);
        let b = alloc_region(&mut tracker, 10);
        let c = alloc_region(&mut tracker, 10);

        // 先释放中间，再释放两侧，最终合并为整个 zone
        tracker.remove(b);
        tracker.check_invariants();
        tracker.remove(a);
        tracker.check_invariants();
        tracker.remove(c);
        tracker.check_invariants();

        assert_eq!(tracker.snapshot(), alloc::vec![(ZONE_BASE, ZONE_PAGES, true)]);
    }

    #[test]
    fn test_fixed_address_splits() {
        let mut tracker = tmem_tracker();

        // 中间切分：前后各留一段空闲
        let mid = alloc_region_at(&mut tracker, ZONE_BASE + 100, 50).unwrap();
        assert_eq!(tracker.get(mid).start_vpn().as_u64(), ZONE_BASE + 100);
        assert_eq!(
            tracker.snapshot(),
            alloc::vec![
                (ZONE_BASE, 100, true),
                (ZONE_BASE + 100, 50, false),
                (ZONE_BASE + 150, ZONE_PAGES - 150, true),
            ]
        );

        // 头部切分
        let front = alloc_region_at(&mut tracker, ZONE_BASE, 40).unwrap();
        assert_eq!(tracker.get(front).start_vpn().as_u64(), ZONE_BASE);

        // 尾部切分
        let tail_start = ZONE_BASE + ZONE_PAGES as u64 - 30;
        let back = alloc_region_at(&mut tracker, tail_start, 30).unwrap();
        assert_eq!(tracker.get(back).start_vpn().as_u64(), tail_start);

        // 整块占用
        let exact = alloc_region_at(&mut tracker, ZONE_BASE + 40, 60).unwrap();
        assert_eq!(tracker.get(exact).nr_pages(), 60);
    }

    #[test]
    fn test_fixed_address_conflicts() {
        let mut tracker = tmem_tracker();
        let _a = alloc_region_at(&mut tracker, ZONE_BASE + 100, 50).unwrap();

        // 已被占用
        assert_eq!(
            alloc_region_at(&mut tracker, ZONE_BASE + 120, 10),
            Err(GvmError::OutOfGpuMemory)
        );
        // 跨越空闲与已分配的边界
        assert_eq!(
            alloc_region_at(&mut tracker, ZONE_BASE + 90, 20),
            Err(GvmError::OutOfGpuMemory)
        );
        // zone 之外
        assert_eq!(
            alloc_region_at(&mut tracker, ZONE_BASE + ZONE_PAGES as u64, 1),
            Err(GvmError::OutOfGpuMemory)
        );
    }

    #[test]
    fn test_zone_isolation() {
        let mut tracker = RegionTracker::new();
        tracker.insert(VaRegion::new_free(Zone::Exec, Vpn(0x100), 256));
        tracker.insert(VaRegion::new_free(Zone::Tmem, Vpn(0x200), 256));

        // TMEM 请求不会落进 EXEC 的空闲区域
        let mut reg = VaRegion::new_free(Zone::Tmem, Vpn(0), 64);
        reg.flags.remove(crate::region::RegionFlags::FREE);
        let id = tracker.add(reg, None, 64, 1).unwrap();
        assert_eq!(tracker.get(id).start_vpn().as_u64(), 0x200);

        // 相邻但不同 zone 的空闲区域不合并
        tracker.remove(id);
        tracker.check_invariants();
        assert_eq!(tracker.by_start.len(), 2);
    }

    #[test]
    fn test_first_fit_alignment() {
        let mut tracker = tmem_tracker();
        // 先占走 3 页，让空闲区域的起点不对齐
        let _head = alloc_region(&mut tracker, 3);

        let mut reg = VaRegion::new_free(Zone::Tmem, Vpn(0), 16);
        reg.flags.remove(crate::region::RegionFlags::FREE);
        let id = tracker.add(reg, None, 16, 16).unwrap();
        tracker.check_invariants();

        let start = tracker.get(id).start_vpn().as_u64();
        assert_eq!(start % 16, 0);
        assert!(start >= ZONE_BASE + 3);
    }

    #[test]
    fn test_alignment_must_be_power_of_two() {
        let mut tracker = tmem_tracker();
        let mut reg = VaRegion::new_free(Zone::Tmem, Vpn(0), 16);
        reg.flags.remove(crate::region::RegionFlags::FREE);
        assert_eq!(
            tracker.add(reg, None, 16, 3),
            Err(GvmError::InvalidArguments)
        );
    }

    #[test]
    fn test_find_lookups() {
        let mut tracker = tmem_tracker();
        let id = alloc_region(&mut tracker, 100);
        let base = tracker.get(id).start_vpn();

        assert_eq!(tracker.find_base_address(base), Some(id));
        assert_eq!(tracker.find_base_address(Vpn(base.as_u64() + 1)), None);
        assert_eq!(tracker.find_enclosing_address(Vpn(base.as_u64() + 99)), Some(id));
        assert_eq!(tracker.find_enclosing_address(Vpn(ZONE_BASE - 1)), None);

        // 已提交范围为空时按提交边界的查找落空
        assert_eq!(
            tracker.find_enclosing_range(VpnRange::from_start_len(base, 1)),
            None
        );
        assert!(
            tracker
                .find_enclosing_range_free(VpnRange::from_start_len(base, 100))
                .is_some()
        );
    }

    #[test]
    #[should_panic(expected = "regions overlap")]
    fn test_overlapping_insert_asserts() {
        let mut tracker = tmem_tracker();
        let _id = alloc_region(&mut tracker, 100);
        // 与现有区域重叠的插入属于编程错误
        tracker.insert(VaRegion::new_free(Zone::Tmem, Vpn(ZONE_BASE + 50), 10));
    }
}
