//! GPU 虚拟内存管理子系统
//!
//! 为每个 GPU 执行上下文维护私有的虚拟地址空间：跟踪空闲与已
//! 分配的区间、按需提交物理页（"可增长"内存）、执行上下文级与
//! 设备级的两级页配额核算，并支持外部缓冲导入与延迟释放协议。
//!
//! # 架构解耦
//!
//! GPU 页表编程、物理页来源与缓存一致性动作不属于本 crate，
//! 通过 trait 解耦：
//! - [`GpuMmuOps`]: 页表安装/拆除/属性更新
//! - [`PhysPageSupplier`]: 物理页的申请与归还
//! - [`GpuCacheOps`]: 写缓冲回刷等待与缓存同步
//! - [`ImportSource`]: 外部导入缓冲的解析与引用管理
//!
//! 实现由设备侧代码在创建 [`Context`] 时注入，没有任何模块级
//! 全局状态。
//!
//! # 并发模型
//!
//! 每个上下文一把 vm 锁，区域跟踪与 resize 操作全程持锁完成；
//! 锁不可重入。页配额计数器使用无锁 CAS，可在锁外读取。

#![no_std]

extern crate alloc;

mod error;
mod phys;
mod usage;

pub mod address;
pub mod device;
pub mod import;
pub mod ops;
pub mod region;
pub mod space;

#[cfg(test)]
mod mock_impls;

pub use address::{PAGE_SHIFT, PAGE_SIZE, Ppn, Vpn, VpnRange};
pub use device::{Device, DeviceConfig, HwWorkarounds, ZoneLayout};
pub use error::{GvmError, GvmResult};
pub use import::{ImportInfo, ImportSource};
pub use ops::{GpuCacheOps, GpuMmuOps, PhysPageSupplier, SyncDirection};
pub use region::{CpuMapping, RegionFlags, VaRegion, Zone};
pub use space::{Context, RegionId, RegionInfo, RegionTracker};
pub use usage::UsageCounter;

// Re-export 用户空间共用定义，方便设备侧代码使用
pub use uapi::{GpuImportKind, GpuMemFlags};
