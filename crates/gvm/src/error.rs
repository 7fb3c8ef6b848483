//! 错误定义

/// GPU 虚拟内存子系统的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvmError {
    /// 目标 zone 中找不到满足要求的空闲虚拟区间
    OutOfGpuMemory,
    /// 物理页或配额预留失败，或页表安装/拆除失败
    OutOfMemory,
    /// 请求不合法（对齐、越界、区域状态不符等）
    InvalidArguments,
    /// 对不可增长的区域发起 resize
    NotGrowable,
    /// 区域存在活跃的 CPU 映射，禁止 resize
    Mapped,
    /// 内部元数据操作失败或目标对象不存在
    Failed,
}

/// GVM 统一结果类型
pub type GvmResult<T> = Result<T, GvmError>;
