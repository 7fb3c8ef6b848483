//! 设备级状态
//!
//! [`Device`] 持有跨上下文共享的状态：设备级页配额、硬件勘误
//! 开关与各上下文共用的地址空间布局。没有任何模块级全局量，
//! 设备对象由探测代码创建后以 `Arc` 传给各上下文。

use bitflags::bitflags;

use crate::address::Vpn;
use crate::region::Zone;
use crate::usage::UsageCounter;

bitflags! {
    /// 硬件勘误开关
    ///
    /// 不同版本的 GPU 需要不同的软件回避措施，由探测代码在
    /// 建立设备时按硬件版本填好。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HwWorkarounds: u32 {
        /// 归还物理页前必须等待 GPU 写缓冲回刷
        const WRITE_FLUSH_BEFORE_FREE = 1 << 0;
        /// 缺页增长块提升为 256 页
        const GROW_BLOCK_LARGE = 1 << 1;
        /// 缺页增长块提升为 512 页
        const GROW_BLOCK_HUGE = 1 << 2;
    }
}

/// 默认的缺页增长块大小（页）
const GROWABLE_BLOCK_PAGES: u32 = 16;
/// `GROW_BLOCK_LARGE` 生效时的增长块大小（页）
const GROWABLE_BLOCK_PAGES_LARGE: u32 = 256;
/// `GROW_BLOCK_HUGE` 生效时的增长块大小（页）
const GROWABLE_BLOCK_PAGES_HUGE: u32 = 512;

/// 每个上下文三个 zone 的起始页号与容量
#[derive(Debug, Clone, Copy)]
pub struct ZoneLayout {
    /// PMEM zone 起始页号
    pub pmem_base: Vpn,
    /// PMEM zone 容量（页）
    pub pmem_pages: u32,
    /// EXEC zone 起始页号
    pub exec_base: Vpn,
    /// EXEC zone 容量（页）
    pub exec_pages: u32,
    /// TMEM zone 起始页号
    pub tmem_base: Vpn,
    /// TMEM zone 容量（页）
    pub tmem_pages: u32,
}

impl ZoneLayout {
    /// 按 (zone, 起始页号, 容量) 列出全部 zone
    pub fn zones(&self) -> [(Zone, Vpn, u32); 3] {
        [
            (Zone::Pmem, self.pmem_base, self.pmem_pages),
            (Zone::Exec, self.exec_base, self.exec_pages),
            (Zone::Tmem, self.tmem_base, self.tmem_pages),
        ]
    }

    /// 给定页号落在哪个 zone
    pub fn zone_of(&self, vpn: Vpn) -> Option<Zone> {
        self.zones()
            .into_iter()
            .find(|&(_, base, nr)| vpn >= base && vpn.0 < base.0 + nr as u64)
            .map(|(zone, _, _)| zone)
    }
}

impl Default for ZoneLayout {
    /// 默认布局：0 号页保留不用；PMEM [4 KiB, 4 GiB)，
    /// EXEC [4 GiB, 20 GiB)，TMEM [20 GiB, 1 TiB)。
    fn default() -> Self {
        ZoneLayout {
            pmem_base: Vpn(1),
            pmem_pages: 0x10_0000 - 1,
            exec_base: Vpn(0x10_0000),
            exec_pages: 0x40_0000,
            tmem_base: Vpn(0x50_0000),
            tmem_pages: 0x0FB0_0000,
        }
    }
}

/// 设备配置
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// 设备级共享内存页数上限
    pub max_shared_pages: u32,
    /// 硬件勘误开关
    pub workarounds: HwWorkarounds,
    /// 每个上下文的 zone 布局
    pub layout: ZoneLayout,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            max_shared_pages: 0x10_0000,
            workarounds: HwWorkarounds::empty(),
            layout: ZoneLayout::default(),
        }
    }
}

/// GPU 设备对象
#[derive(Debug)]
pub struct Device {
    usage: UsageCounter,
    workarounds: HwWorkarounds,
    layout: ZoneLayout,
}

impl Device {
    /// 按配置建立设备对象
    pub fn new(config: DeviceConfig) -> Self {
        Device {
            usage: UsageCounter::new(config.max_shared_pages),
            workarounds: config.workarounds,
            layout: config.layout,
        }
    }

    /// 设备级页配额计数器
    pub fn usage(&self) -> &UsageCounter {
        &self.usage
    }

    /// 设备级当前已用页数
    pub fn used_pages(&self) -> u32 {
        self.usage.current()
    }

    /// 硬件勘误开关
    pub fn workarounds(&self) -> HwWorkarounds {
        self.workarounds
    }

    /// 上下文地址空间布局
    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    /// 当前生效的缺页增长块大小（页）
    pub fn growable_block_pages(&self) -> u32 {
        if self.workarounds.contains(HwWorkarounds::GROW_BLOCK_HUGE) {
            GROWABLE_BLOCK_PAGES_HUGE
        } else if self.workarounds.contains(HwWorkarounds::GROW_BLOCK_LARGE) {
            GROWABLE_BLOCK_PAGES_LARGE
        } else {
            GROWABLE_BLOCK_PAGES
        }
    }

    /// 把页数向上取整到增长块；回绕时返回 None
    pub fn round_growable_size(&self, nr_pages: u32) -> Option<u32> {
        let block = self.growable_block_pages();
        nr_pages
            .checked_add(block - 1)
            .map(|v| v & !(block - 1))
    }

    /// 量化 resize 增量：增长向上取整，收缩的幅度向下取整
    ///
    /// 向下取整意味着一个较小的负增量可能归零。无法表示的
    /// 增量（过大）返回 None。
    pub fn round_growable_delta(&self, delta: i64) -> Option<i64> {
        if delta >= 0 {
            let rounded = self.round_growable_size(u32::try_from(delta).ok()?)?;
            Some(rounded as i64)
        } else {
            let block = self.growable_block_pages() as u64;
            let magnitude = delta.unsigned_abs() & !(block - 1);
            // i64::MIN 的幅度无法取负
            let magnitude = i64::try_from(magnitude).ok()?;
            Some(-magnitude)
        }
    }
}
