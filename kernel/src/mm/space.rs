//! Per-process userspace address-space bookkeeping.
//!
//! A [`SpaceManager`] owns a process's [`TableManager`] plus the ordered
//! list of named [`UserspaceRegion`]s mapped into it. Regions never
//! overlap; mapped permissions are the request intersected with the
//! backing's capabilities.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{SysError, SysResult};
use crate::utils::align_up;

use super::{
    BackingRegion, MemoryOperation, TableManager, UserOwnedAllocation, UserRegion, VirtualAddress,
    PAGE_SIZE, USER_VADDR_BASE, USER_VADDR_TOP,
};

/// One named mapping within a process.
pub struct UserspaceRegion {
    pub user_region: UserRegion,
    pub backing: Arc<BackingRegion>,
    pub name: String,
    pub permissions: MemoryOperation,
}

pub struct SpaceManager {
    /// Sorted by start address.
    regions: Vec<UserspaceRegion>,
    tables: TableManager,
}

impl SpaceManager {
    pub fn create() -> SysResult<Self> {
        Ok(Self {
            regions: Vec::new(),
            tables: TableManager::create().ok_or(SysError::OutOfMemory)?,
        })
    }

    /// Physical root pointer for the architectural address-space switch.
    pub fn raw_root_ptr(&self) -> u64 {
        self.tables.raw_root_ptr()
    }

    pub fn regions(&self) -> &[UserspaceRegion] {
        &self.regions
    }

    fn insert_sorted(&mut self, region: UserspaceRegion) {
        let at = self
            .regions
            .partition_point(|r| r.user_region.start < region.user_region.start);
        self.regions.insert(at, region);
    }

    /// First hole of `size` bytes at or above `from`, page-aligned.
    fn find_hole(&self, from: usize, size: usize) -> Option<usize> {
        let mut candidate = align_up(from.max(USER_VADDR_BASE), PAGE_SIZE);
        for region in &self.regions {
            let start = region.user_region.start.get();
            let end = region.user_region.end().get();
            if candidate + size <= start {
                break;
            }
            if candidate < end {
                candidate = end;
            }
        }
        (candidate + size <= USER_VADDR_TOP).then_some(candidate)
    }

    fn is_free(&self, candidate: UserRegion) -> bool {
        self.regions
            .iter()
            .all(|r| !r.user_region.overlaps(&candidate))
    }

    /// Map `backing` at `location` (exactly, failing if occupied) or at the
    /// first free slot. Returns the chosen region start.
    pub fn place_region(
        &mut self,
        location: Option<usize>,
        allowed_operations: MemoryOperation,
        name: String,
        backing: Arc<BackingRegion>,
    ) -> SysResult<UserRegion> {
        let size = align_up(backing.size(), PAGE_SIZE);
        let start = match location {
            Some(location) => {
                if location % PAGE_SIZE != 0 {
                    return Err(SysError::InvalidArgument);
                }
                let wanted = UserRegion::new(VirtualAddress::new(location), size);
                if location < USER_VADDR_BASE
                    || location + size > USER_VADDR_TOP
                    || !self.is_free(wanted)
                {
                    return Err(SysError::Exists);
                }
                location
            }
            None => self
                .find_hole(USER_VADDR_BASE, size)
                .ok_or(SysError::OutOfMemory)?,
        };

        let user_region = UserRegion::new(VirtualAddress::new(start), size);
        backing.map_into_table(&mut self.tables, user_region, 0, allowed_operations)?;
        self.insert_sorted(UserspaceRegion {
            user_region,
            backing,
            name,
            permissions: allowed_operations,
        });
        Ok(user_region)
    }

    /// Allocate fresh pages and map them exactly at `region`.
    pub fn allocate_placed_region(
        &mut self,
        region: UserRegion,
        allowed_operations: MemoryOperation,
        name: &str,
    ) -> SysResult<Arc<BackingRegion>> {
        if !region.page_aligned() {
            return Err(SysError::InvalidArgument);
        }
        let backing = Arc::new(BackingRegion::UserOwned(
            UserOwnedAllocation::create_contiguous(region.size / PAGE_SIZE)?,
        ));
        self.place_region(
            Some(region.start.get()),
            allowed_operations,
            String::from(name),
            backing.clone(),
        )?;
        Ok(backing)
    }

    /// Allocate fresh pages at a kernel-chosen address (near `hint` when
    /// supplied).
    pub fn allocate_flexible_region(
        &mut self,
        size: usize,
        allowed_operations: MemoryOperation,
        name: &str,
        hint: Option<usize>,
    ) -> SysResult<UserRegion> {
        let size = align_up(size, PAGE_SIZE);
        if size == 0 {
            return Err(SysError::InvalidArgument);
        }
        let start = self
            .find_hole(hint.unwrap_or(USER_VADDR_BASE), size)
            .or_else(|| self.find_hole(USER_VADDR_BASE, size))
            .ok_or(SysError::OutOfMemory)?;
        let backing = Arc::new(BackingRegion::UserOwned(
            UserOwnedAllocation::create_contiguous(size / PAGE_SIZE)?,
        ));
        self.place_region(Some(start), allowed_operations, String::from(name), backing)
    }

    /// True iff `[ptr, ptr+size)` lies inside a single region whose
    /// permissions contain `operation`.
    pub fn check_region(&self, ptr: usize, size: usize, operation: MemoryOperation) -> bool {
        self.regions.iter().any(|r| {
            r.user_region
                .contains_range(VirtualAddress::new(ptr), size)
                && r.permissions.contains(operation)
        })
    }

    /// Remove the region exactly matching `[ptr, ptr+size)`.
    pub fn deallocate_userspace_region(&mut self, ptr: usize, size: usize) -> SysResult<()> {
        let index = self
            .regions
            .iter()
            .position(|r| r.user_region.start.get() == ptr && r.user_region.size == size)
            .ok_or(SysError::NoEntry)?;
        let region = self.regions.remove(index);
        region
            .backing
            .unmap_from_table(&mut self.tables, region.user_region, 0)?;
        Ok(())
    }

    /// Remove every region referencing `backing` (Interlink revocation).
    pub fn deallocate_backing(&mut self, backing: &Arc<BackingRegion>) -> SysResult<()> {
        let mut found = false;
        let mut index = 0;
        while index < self.regions.len() {
            if Arc::ptr_eq(&self.regions[index].backing, backing) {
                let region = self.regions.remove(index);
                region
                    .backing
                    .unmap_from_table(&mut self.tables, region.user_region, 0)?;
                found = true;
            } else {
                index += 1;
            }
        }
        if found {
            Ok(())
        } else {
            Err(SysError::NoEntry)
        }
    }

    /// Duplicate the whole address space for a forked child. Each backing
    /// decides whether to alias or copy.
    pub fn clone_for_fork(&self) -> SysResult<SpaceManager> {
        let mut child = SpaceManager::create()?;
        for region in &self.regions {
            let backing = region.backing.clone_for_fork(region.permissions)?;
            backing.map_into_table(
                &mut child.tables,
                region.user_region,
                0,
                region.permissions,
            )?;
            child.insert_sorted(UserspaceRegion {
                user_region: region.user_region,
                backing,
                name: region.name.clone(),
                permissions: region.permissions,
            });
        }
        Ok(child)
    }

    /// Look up the region containing `ptr` (Interlink memory donation).
    pub fn region_containing(&self, ptr: usize, size: usize) -> Option<&UserspaceRegion> {
        self.regions
            .iter()
            .find(|r| r.user_region.contains_range(VirtualAddress::new(ptr), size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{DeviceBackedRegion, PhysicalAddress, PhysicalRegion};

    fn device_backing(pages: usize) -> Arc<BackingRegion> {
        Arc::new(BackingRegion::DeviceBacked(DeviceBackedRegion::new(
            PhysicalRegion::new(PhysicalAddress::new(0x0900_0000), pages * PAGE_SIZE),
        )))
    }

    fn manager_with(regions: &[(usize, usize)]) -> SpaceManager {
        let mut sm = SpaceManager::create().unwrap();
        for &(start, pages) in regions {
            sm.place_region(
                Some(start),
                MemoryOperation::READ | MemoryOperation::WRITE,
                String::from("fixture"),
                device_backing(pages),
            )
            .unwrap();
        }
        sm
    }

    #[test]
    fn regions_never_overlap() {
        let mut sm = manager_with(&[(0x10000, 2), (0x20000, 1)]);
        assert_eq!(
            sm.place_region(
                Some(0x11000),
                MemoryOperation::READ,
                String::from("clash"),
                device_backing(1),
            ),
            Err(SysError::Exists)
        );
        // Flexible placement skips the occupied slots.
        let placed = sm
            .place_region(
                None,
                MemoryOperation::READ,
                String::from("flex"),
                device_backing(4),
            )
            .unwrap();
        for window in sm.regions().windows(2) {
            assert!(!window[0].user_region.overlaps(&window[1].user_region));
            assert!(window[0].user_region.page_aligned());
        }
        assert!(placed.page_aligned());
    }

    #[test]
    fn check_region_honours_bounds_and_permissions() {
        let mut sm = SpaceManager::create().unwrap();
        sm.place_region(
            Some(0x10000),
            MemoryOperation::READ,
            String::from("ro"),
            device_backing(2),
        )
        .unwrap();

        assert!(sm.check_region(0x10000, 2 * PAGE_SIZE, MemoryOperation::READ));
        assert!(sm.check_region(0x10800, 0x100, MemoryOperation::READ));
        // Write not permitted on a read-only region.
        assert!(!sm.check_region(0x10000, 0x100, MemoryOperation::WRITE));
        // Range straddles past the region's end.
        assert!(!sm.check_region(0x11800, PAGE_SIZE, MemoryOperation::READ));
        // Unmapped address.
        assert!(!sm.check_region(0x40000, 1, MemoryOperation::READ));
    }

    #[test]
    fn deallocate_is_exact_then_noent() {
        let mut sm = manager_with(&[(0x10000, 2)]);
        // Size mismatch is not a match.
        assert_eq!(
            sm.deallocate_userspace_region(0x10000, PAGE_SIZE),
            Err(SysError::NoEntry)
        );
        sm.deallocate_userspace_region(0x10000, 2 * PAGE_SIZE).unwrap();
        assert_eq!(
            sm.deallocate_userspace_region(0x10000, 2 * PAGE_SIZE),
            Err(SysError::NoEntry)
        );
        // The slot is reusable afterwards.
        sm.place_region(
            Some(0x10000),
            MemoryOperation::READ,
            String::from("again"),
            device_backing(2),
        )
        .unwrap();
    }

    #[test]
    fn deallocate_by_backing_removes_all_views() {
        let mut sm = SpaceManager::create().unwrap();
        let shared = device_backing(1);
        sm.place_region(
            Some(0x10000),
            MemoryOperation::READ,
            String::from("a"),
            shared.clone(),
        )
        .unwrap();
        sm.place_region(
            Some(0x20000),
            MemoryOperation::READ,
            String::from("b"),
            shared.clone(),
        )
        .unwrap();
        sm.deallocate_backing(&shared).unwrap();
        assert!(sm.regions().is_empty());
        assert_eq!(sm.deallocate_backing(&shared), Err(SysError::NoEntry));
    }

    #[test]
    fn fork_clone_preserves_layout() {
        let sm = manager_with(&[(0x10000, 2), (0x30000, 1)]);
        let child = sm.clone_for_fork().unwrap();
        assert_eq!(child.regions().len(), 2);
        for (parent_region, child_region) in sm.regions().iter().zip(child.regions()) {
            assert_eq!(parent_region.user_region, child_region.user_region);
            assert_eq!(parent_region.permissions, child_region.permissions);
            // Device windows alias rather than copy.
            assert!(Arc::ptr_eq(&parent_region.backing, &child_region.backing));
        }
    }
}
