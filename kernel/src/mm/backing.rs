//! Backing regions: kernel objects that know how to map themselves into a
//! process address space.
//!
//! The variant set is closed, so the polymorphism is a tagged enum rather
//! than a trait object. Shareability is carried by the `Arc` every holder
//! already uses: Interlink hands a region to another process by cloning
//! the `Arc` and mapping it there.

use alloc::sync::Arc;

use crate::error::{SysError, SysResult};

use super::page_table::MappingAttributes;
use super::{
    MemoryOperation, MemoryType, PhysicalAddress, PhysicalRegion, TableManager, UserRegion,
    VirtualRegion, PAGE_ALLOCATOR, PAGE_SIZE,
};

/// A region of memory backing part of a userspace address space.
pub enum BackingRegion {
    /// Kernel-allocated physical pages owned by this object.
    UserOwned(UserOwnedAllocation),
    /// A fixed window of device MMIO.
    DeviceBacked(DeviceBackedRegion),
}

impl BackingRegion {
    pub fn size(&self) -> usize {
        match self {
            Self::UserOwned(alloc) => alloc.kernel_region().size,
            Self::DeviceBacked(dev) => dev.region.size,
        }
    }

    /// Operations this backing can ever permit; mapped permissions are the
    /// intersection of the request with this set.
    pub fn capabilities(&self) -> MemoryOperation {
        match self {
            Self::UserOwned(_) => {
                MemoryOperation::READ | MemoryOperation::WRITE | MemoryOperation::EXECUTE
            }
            // Executing from device memory is never meaningful.
            Self::DeviceBacked(_) => MemoryOperation::READ | MemoryOperation::WRITE,
        }
    }

    /// Kernel-virtual view for kernel-side copies (ELF loading, fork).
    /// Only RAM-backed regions have one.
    pub fn kernel_view(&self) -> Option<VirtualRegion> {
        match self {
            Self::UserOwned(alloc) => Some(alloc.kernel_region()),
            Self::DeviceBacked(_) => None,
        }
    }

    /// Map this region into `tables` at `user_region`.
    ///
    /// `offset` (page-aligned) selects a window when the backing is larger
    /// than the destination.
    pub fn map_into_table(
        &self,
        tables: &mut TableManager,
        user_region: UserRegion,
        offset: usize,
        operations: MemoryOperation,
    ) -> SysResult<()> {
        if !user_region.page_aligned()
            || offset % PAGE_SIZE != 0
            || user_region.size + offset > self.size()
        {
            return Err(SysError::InvalidArgument);
        }
        let operations = operations & self.capabilities();
        let (phys, memtype) = match self {
            Self::UserOwned(alloc) => (alloc.physical_base(), MemoryType::NormalRam),
            Self::DeviceBacked(dev) => (dev.region.start, MemoryType::Mmio),
        };
        if tables.map_region(
            user_region.start.get(),
            phys.offset(offset as u64),
            user_region.size,
            MappingAttributes::user(operations),
            memtype,
        ) {
            Ok(())
        } else {
            Err(SysError::Failed)
        }
    }

    /// Undo a [`map_into_table`](Self::map_into_table) with identical
    /// arguments.
    pub fn unmap_from_table(
        &self,
        tables: &mut TableManager,
        user_region: UserRegion,
        offset: usize,
    ) -> SysResult<()> {
        if !user_region.page_aligned()
            || offset % PAGE_SIZE != 0
            || user_region.size + offset > self.size()
        {
            return Err(SysError::InvalidArgument);
        }
        if tables.unmap_region(user_region.start.get(), user_region.size) {
            Ok(())
        } else {
            Err(SysError::Failed)
        }
    }

    /// Produce the child's backing on fork.
    ///
    /// Read-only regions and device windows are aliased; writable RAM is
    /// copied eagerly (copy-on-write is a noted future improvement).
    pub fn clone_for_fork(
        self: &Arc<Self>,
        permissions: MemoryOperation,
    ) -> SysResult<Arc<BackingRegion>> {
        match &**self {
            Self::DeviceBacked(_) => Ok(self.clone()),
            Self::UserOwned(alloc) => {
                if !permissions.contains(MemoryOperation::WRITE) {
                    return Ok(self.clone());
                }
                let pages = alloc.kernel_region().size / PAGE_SIZE;
                let copy = UserOwnedAllocation::create_contiguous(pages)?;
                #[cfg(target_os = "none")]
                // SAFETY: both regions are linear-mapped kernel views of
                // page runs of identical size owned by their allocations.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        alloc.kernel_region().start.as_ptr::<u8>(),
                        copy.kernel_region().start.as_mut_ptr::<u8>(),
                        alloc.kernel_region().size,
                    );
                }
                Ok(Arc::new(BackingRegion::UserOwned(copy)))
            }
        }
    }
}

/// A contiguous run of kernel-allocated physical pages with its
/// linear-map kernel view.
pub struct UserOwnedAllocation {
    kernel_region: VirtualRegion,
    physical_base: PhysicalAddress,
}

impl UserOwnedAllocation {
    pub fn create_contiguous(pages: usize) -> SysResult<Self> {
        let region = PAGE_ALLOCATOR
            .lock()
            .allocate_region(pages)
            .ok_or(SysError::OutOfMemory)?;
        Ok(Self {
            kernel_region: VirtualRegion::new(region.start.to_kernel_virt(), region.size),
            physical_base: region.start,
        })
    }

    pub fn kernel_region(&self) -> VirtualRegion {
        self.kernel_region
    }

    pub fn physical_base(&self) -> PhysicalAddress {
        self.physical_base
    }
}

impl Drop for UserOwnedAllocation {
    fn drop(&mut self) {
        PAGE_ALLOCATOR.lock().free_region(self.physical_base);
    }
}

/// A window of device MMIO handed to userspace (framebuffers and the
/// like). The physical range belongs to the device, not this object.
pub struct DeviceBackedRegion {
    region: PhysicalRegion,
}

impl DeviceBackedRegion {
    pub fn new(region: PhysicalRegion) -> Self {
        debug_assert!(region.page_aligned());
        Self { region }
    }

    pub fn region(&self) -> PhysicalRegion {
        self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_backing(pages: usize) -> Arc<BackingRegion> {
        Arc::new(BackingRegion::DeviceBacked(DeviceBackedRegion::new(
            PhysicalRegion::new(PhysicalAddress::new(0x0900_0000), pages * PAGE_SIZE),
        )))
    }

    #[test]
    fn device_backing_aliases_on_fork() {
        let backing = device_backing(2);
        let clone = backing
            .clone_for_fork(MemoryOperation::READ | MemoryOperation::WRITE)
            .unwrap();
        assert!(Arc::ptr_eq(&backing, &clone));
    }

    #[test]
    fn device_backing_never_executable() {
        let backing = device_backing(1);
        assert!(!backing.capabilities().contains(MemoryOperation::EXECUTE));
        assert!(backing.kernel_view().is_none());
    }

    #[test]
    fn map_rejects_misaligned_window() {
        let backing = device_backing(2);
        let mut tables = TableManager::create().unwrap();
        let region = UserRegion::new(crate::mm::VirtualAddress::new(0x10000), PAGE_SIZE);
        assert_eq!(
            backing.map_into_table(&mut tables, region, 123, MemoryOperation::READ),
            Err(SysError::InvalidArgument)
        );
        // Window past the end of the backing.
        assert_eq!(
            backing.map_into_table(&mut tables, region, 2 * PAGE_SIZE, MemoryOperation::READ),
            Err(SysError::InvalidArgument)
        );
        backing
            .map_into_table(&mut tables, region, PAGE_SIZE, MemoryOperation::READ)
            .unwrap();
    }
}
