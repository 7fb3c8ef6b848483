//! 同步原语
//!
//! 向驱动的其它模块提供基本的互斥原语。
//!
//! GPU 驱动的入口全部运行在可阻塞的进程上下文（系统调用与
//! 缺页处理路径），没有中断上下文的调用方，因此这里不包含
//! 中断保护相关的封装。

#![no_std]

mod raw_spin_lock;
mod spin_lock;

pub use raw_spin_lock::*;
pub use spin_lock::*;
