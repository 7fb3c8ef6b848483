//! GPU 内存分配请求的公共定义
//!
//! 用户空间通过这些标志描述一次分配的访问权限、缓存策略与
//! 增长方式；驱动据此填写区域的内部属性位。

use bitflags::bitflags;

bitflags! {
    /// GPU 内存分配请求标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GpuMemFlags: u32 {
        /// CPU 可读
        const PROT_CPU_RD = 1 << 0;
        /// CPU 可写
        const PROT_CPU_WR = 1 << 1;
        /// GPU 可读
        const PROT_GPU_RD = 1 << 2;
        /// GPU 可写
        const PROT_GPU_WR = 1 << 3;
        /// GPU 可执行
        const PROT_GPU_EX = 1 << 4;
        /// 按 GPU 缺页增长（物理页在缺页时才提交）
        const GROW_ON_GPF = 1 << 5;
        /// CPU 侧启用缓存
        const CACHED_CPU = 1 << 6;
        /// 与同一 GPU 核心组内的观察者保持一致性
        const COHERENT_LOCAL = 1 << 7;
        /// 与系统内所有观察者保持一致性
        const COHERENT_SYSTEM = 1 << 8;
    }
}

impl GpuMemFlags {
    /// 校验一次分配请求的标志组合是否合法
    pub fn is_valid_alloc_request(self) -> bool {
        // 至少要设置一个标志
        if self.is_empty() {
            return false;
        }

        // CPU 或 GPU 至少要有一方读取该内存
        if !self.intersects(Self::PROT_CPU_RD | Self::PROT_GPU_RD) {
            return false;
        }

        // CPU 或 GPU 至少要有一方写入该内存
        if !self.intersects(Self::PROT_CPU_WR | Self::PROT_GPU_WR) {
            return false;
        }

        // 可执行内存不允许 GPU 写入，也不允许缺页增长
        if self.contains(Self::PROT_GPU_EX)
            && self.intersects(Self::PROT_GPU_WR | Self::GROW_ON_GPF)
        {
            return false;
        }

        // GPU 侧完全不可访问的分配没有意义
        if !self.intersects(Self::PROT_GPU_RD | Self::PROT_GPU_WR) {
            return false;
        }

        true
    }
}

/// 导入内存的外部来源类别
///
/// 在导入时一次性确定，之后不再改变。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuImportKind {
    /// 跨进程共享分配器的句柄，物理页在导入时即常驻
    SharedAlloc,
    /// 外部管理的缓冲对象，物理页在附着（attach）时才可用
    DmaBuf,
}
