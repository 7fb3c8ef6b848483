//! 与用户空间共用的 GPU 驱动定义
//!
//! 包含分配请求标志与导入类型，确保内核与用户空间的一致性

#![no_std]
#![allow(dead_code)]

pub mod gpu_mem;

pub use gpu_mem::{GpuImportKind, GpuMemFlags};
