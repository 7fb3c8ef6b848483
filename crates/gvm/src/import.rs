//! 外部内存导入
//!
//! 导入区域的物理页由其它子系统持有：共享分配器按句柄给出
//! 常驻页列表，外部缓冲对象则在附着（attach）后才提供页。
//! 两种来源都不经过本地的物理页供给与配额核算。
//!
//! 来源类别在导入时一次性确定（见 [`uapi::GpuImportKind`]），
//! 之后不再按操作重新分派。

use alloc::vec::Vec;

use uapi::GpuImportKind;

use crate::address::Ppn;
use crate::error::GvmResult;
use crate::region::RegionFlags;

/// 外部导入来源需要实现的能力集合
///
/// 一个实现对应一个被导入的缓冲，由导入区域独占持有。
pub trait ImportSource: Send {
    /// 来源类别
    fn kind(&self) -> GpuImportKind;

    /// 解析句柄：查询页数、物理页列表与访问能力
    ///
    /// 外部缓冲对象风格的来源在附着前页号未知，此时页列表
    /// 以占位值填充，长度仍等于缓冲的页数。
    fn resolve(&mut self) -> GvmResult<ImportInfo>;

    /// 进入活跃使用状态（第一个使用方引用时调用）
    fn attach(&mut self) -> GvmResult<()>;

    /// 退出活跃使用状态（最后一个使用方引用消失时调用）
    fn detach(&mut self);

    /// 释放对外部缓冲的持有（区域销毁时调用一次）
    fn release(&mut self);
}

/// [`ImportSource::resolve`] 的结果
pub struct ImportInfo {
    /// 物理页列表，长度即导入区域的容量
    pub pages: Vec<Ppn>,
    /// 来源授予的访问与缓存属性
    ///
    /// 只允许访问/缓存/一致性相关的位，其余位会被忽略。
    pub access: RegionFlags,
}
