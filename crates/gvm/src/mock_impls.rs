//! 为 test-support 的 Mock 类型实现本 crate 的协作 trait
//!
//! Mock 内部只有原子量，测试侧以 `Arc<Mock…>` 把同一实例注入
//! 被测对象并保留一个克隆用于断言与故障注入。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use test_support::mock::{MockCacheOps, MockGpuMmu, MockImportSource, MockPageSupplier};
use uapi::GpuImportKind;

use crate::address::{Ppn, Vpn};
use crate::error::{GvmError, GvmResult};
use crate::import::{ImportInfo, ImportSource};
use crate::ops::{GpuCacheOps, GpuMmuOps, PhysPageSupplier, SyncDirection};
use crate::region::RegionFlags;

impl GpuMmuOps for Arc<MockGpuMmu> {
    fn install_pages(&self, start: Vpn, pages: &[Ppn], _flags: RegionFlags) -> GvmResult<()> {
        self.install(start.as_u64(), pages.len())
            .map_err(|()| GvmError::OutOfMemory)
    }

    fn teardown_pages(&self, start: Vpn, nr_pages: u32) -> GvmResult<()> {
        self.teardown(start.as_u64(), nr_pages as usize)
            .map_err(|()| GvmError::OutOfMemory)
    }

    fn update_pages(&self, start: Vpn, pages: &[Ppn], _flags: RegionFlags) -> GvmResult<()> {
        self.update(start.as_u64(), pages.len())
            .map_err(|()| GvmError::Failed)
    }
}

impl PhysPageSupplier for Arc<MockPageSupplier> {
    fn alloc_pages(&self, nr_pages: u32) -> Option<Vec<Ppn>> {
        let first = self.alloc(nr_pages as usize)?;
        Some((0..nr_pages as u64).map(|i| Ppn(first + i)).collect())
    }

    fn free_pages(&self, pages: &[Ppn], sync_back: bool) {
        self.free(pages.len(), sync_back);
    }
}

impl GpuCacheOps for Arc<MockCacheOps> {
    fn wait_gpu_write_flush(&self) {
        self.wait_write_flush();
    }

    fn sync_range(&self, paddr: u64, len: usize, _dir: SyncDirection) {
        self.sync(paddr, len);
    }
}

impl ImportSource for Arc<MockImportSource> {
    fn kind(&self) -> GpuImportKind {
        if self.is_dma_buf() {
            GpuImportKind::DmaBuf
        } else {
            GpuImportKind::SharedAlloc
        }
    }

    fn resolve(&mut self) -> GvmResult<ImportInfo> {
        let (base, nr_pages) =
            MockImportSource::resolve(&**self).map_err(|()| GvmError::Failed)?;
        if self.is_dma_buf() {
            // 附着前页号未知，用占位值填充
            Ok(ImportInfo {
                pages: vec![Ppn(0); nr_pages],
                access: RegionFlags::empty(),
            })
        } else {
            Ok(ImportInfo {
                pages: (0..nr_pages as u64).map(|i| Ppn(base + i)).collect(),
                access: RegionFlags::CPU_RD
                    | RegionFlags::CPU_WR
                    | RegionFlags::GPU_RD
                    | RegionFlags::GPU_WR,
            })
        }
    }

    fn attach(&mut self) -> GvmResult<()> {
        MockImportSource::attach(&**self).map_err(|()| GvmError::Failed)
    }

    fn detach(&mut self) {
        MockImportSource::detach(&**self);
    }

    fn release(&mut self) {
        MockImportSource::release(&**self);
    }
}
