//! 外部协作者的 Mock 实现
//!
//! 注意：这里不直接依赖 `gvm` crate（避免循环依赖）。
//! `gvm` crate 在 `cfg(test)` 下为这些类型实现其 trait
//! （例如 `GpuMmuOps` / `PhysPageSupplier`）。
//!
//! 所有 Mock 只用原子量记录状态，可以经由 `Arc` 共享给被测
//! 对象，测试侧保留一个克隆用于断言与故障注入。

mod cache;
mod import;
mod mmu;
mod pages;

pub use cache::MockCacheOps;
pub use import::MockImportSource;
pub use mmu::MockGpuMmu;
pub use pages::MockPageSupplier;
