//! 4-level translation table programming for user address spaces.
//!
//! A [`TableManager`] owns the TTBR0-side table tree of one process. The
//! kernel half lives behind TTBR1, is shared between all processes and is
//! never touched here, so no user mapping can shadow or unmap kernel
//! memory. Mappings use the 4 KiB granule exclusively.
//!
//! Table pages are allocated from the physical page allocator on demand
//! and returned as soon as a subtable empties on unmap; `unmap_region`
//! followed by a matching `map_region` always succeeds.

use super::{MemoryOperation, MemoryType, PhysicalAddress, PAGE_SIZE};

/// Attribute set requested for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingAttributes {
    pub operations: MemoryOperation,
    pub user_accessible: bool,
}

impl MappingAttributes {
    /// Attributes for a userspace mapping.
    pub fn user(operations: MemoryOperation) -> Self {
        Self {
            operations,
            user_accessible: true,
        }
    }

    /// Fixed attribute set for kernel-side mappings: read/write, never
    /// executable, never user-accessible.
    pub fn kernel() -> Self {
        Self {
            operations: MemoryOperation::READ | MemoryOperation::WRITE,
            user_accessible: false,
        }
    }
}

#[cfg(target_os = "none")]
mod hw {
    use super::*;
    use crate::mm::PAGE_ALLOCATOR;

    const ENTRIES_PER_TABLE: usize = 512;
    const LEVELS: usize = 4;

    // Descriptor bits (VMSAv8-64, 4 KiB granule).
    const DESC_VALID: u64 = 1 << 0;
    /// Table pointer at levels 0-2, page descriptor at level 3.
    const DESC_TABLE_OR_PAGE: u64 = 1 << 1;
    const DESC_ACCESS_FLAG: u64 = 1 << 10;
    const DESC_INNER_SHAREABLE: u64 = 0b11 << 8;
    /// AP[1]: EL0 accessible.
    const DESC_AP_EL0: u64 = 1 << 6;
    /// AP[2]: read-only.
    const DESC_AP_RO: u64 = 1 << 7;
    const DESC_PXN: u64 = 1 << 53;
    const DESC_UXN: u64 = 1 << 54;
    /// MAIR indices programmed by the boot stub: 0 = normal write-back,
    /// 1 = device-nGnRE.
    const ATTR_INDEX_NORMAL: u64 = 0 << 2;
    const ATTR_INDEX_DEVICE: u64 = 1 << 2;

    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    fn leaf_attributes(attrs: MappingAttributes, memtype: MemoryType) -> u64 {
        let mut desc = DESC_VALID | DESC_TABLE_OR_PAGE | DESC_ACCESS_FLAG;
        desc |= match memtype {
            MemoryType::NormalRam => ATTR_INDEX_NORMAL | DESC_INNER_SHAREABLE,
            MemoryType::Mmio => ATTR_INDEX_DEVICE,
        };
        if attrs.user_accessible {
            desc |= DESC_AP_EL0;
        }
        if !attrs.operations.contains(MemoryOperation::WRITE) {
            desc |= DESC_AP_RO;
        }
        if !(attrs.user_accessible && attrs.operations.contains(MemoryOperation::EXECUTE)) {
            desc |= DESC_UXN;
        }
        // The kernel never executes from managed mappings.
        desc | DESC_PXN
    }

    fn table_index(virt: usize, level: usize) -> usize {
        (virt >> (12 + 9 * (LEVELS - 1 - level))) & (ENTRIES_PER_TABLE - 1)
    }

    fn entry_ptr(table: PhysicalAddress, index: usize) -> *mut u64 {
        table
            .to_kernel_virt()
            .offset(index * core::mem::size_of::<u64>())
            .as_mut_ptr()
    }

    fn read_entry(table: PhysicalAddress, index: usize) -> u64 {
        // SAFETY: `table` is a live table page owned by this manager,
        // accessed through the kernel linear map.
        unsafe { entry_ptr(table, index).read_volatile() }
    }

    fn write_entry(table: PhysicalAddress, index: usize, value: u64) {
        // SAFETY: as in read_entry; volatile so the walker hardware and
        // this code agree on ordering.
        unsafe { entry_ptr(table, index).write_volatile(value) }
    }

    fn allocate_table_page() -> Option<PhysicalAddress> {
        let region = PAGE_ALLOCATOR.lock().allocate_region(1)?;
        // SAFETY: freshly allocated page, exclusively ours, linear-mapped.
        unsafe {
            core::ptr::write_bytes(region.start.to_kernel_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
        Some(region.start)
    }

    /// Owner of one process's TTBR0 table tree.
    pub struct TableManager {
        root: PhysicalAddress,
    }

    impl TableManager {
        pub fn create() -> Option<Self> {
            Some(Self {
                root: allocate_table_page()?,
            })
        }

        /// Physical pointer suitable for the TTBR0 write on context switch.
        pub fn raw_root_ptr(&self) -> u64 {
            self.root.get()
        }

        /// Map `[virt, virt+size)` to `[phys, phys+size)`.
        ///
        /// All three of `virt`, `phys` and `size` must be page-aligned and
        /// the range must not already be mapped.
        pub fn map_region(
            &mut self,
            virt: usize,
            phys: PhysicalAddress,
            size: usize,
            attrs: MappingAttributes,
            memtype: MemoryType,
        ) -> bool {
            if virt % PAGE_SIZE != 0 || phys.page_offset() != 0 || size % PAGE_SIZE != 0 {
                return false;
            }
            let leaf = leaf_attributes(attrs, memtype);
            for page in 0..size / PAGE_SIZE {
                let va = virt + page * PAGE_SIZE;
                let pa = phys.offset((page * PAGE_SIZE) as u64);
                if !self.map_page(va, pa, leaf) {
                    // Roll back already-established pages of this request.
                    self.unmap_region(virt, page * PAGE_SIZE);
                    return false;
                }
            }
            true
        }

        fn map_page(&mut self, virt: usize, phys: PhysicalAddress, leaf: u64) -> bool {
            let mut table = self.root;
            for level in 0..LEVELS - 1 {
                let index = table_index(virt, level);
                let entry = read_entry(table, index);
                if entry & DESC_VALID == 0 {
                    let Some(new_table) = allocate_table_page() else {
                        return false;
                    };
                    write_entry(table, index, new_table.get() | DESC_VALID | DESC_TABLE_OR_PAGE);
                    table = new_table;
                } else {
                    table = PhysicalAddress::new(entry & ADDR_MASK);
                }
            }
            let index = table_index(virt, LEVELS - 1);
            if read_entry(table, index) & DESC_VALID != 0 {
                return false;
            }
            write_entry(table, index, (phys.get() & ADDR_MASK) | leaf);
            true
        }

        /// Remove the mapping of `[virt, virt+size)`, releasing any table
        /// page that becomes empty.
        pub fn unmap_region(&mut self, virt: usize, size: usize) -> bool {
            if virt % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
                return false;
            }
            let mut ok = true;
            for page in 0..size / PAGE_SIZE {
                ok &= Self::unmap_walk(self.root, 0, virt + page * PAGE_SIZE);
            }
            crate::arch::invalidate_tlb_all();
            ok
        }

        /// Clears the leaf for `virt` below `table`; frees subtables that
        /// end up empty. Returns false if the page was not mapped.
        fn unmap_walk(table: PhysicalAddress, level: usize, virt: usize) -> bool {
            let index = table_index(virt, level);
            let entry = read_entry(table, index);
            if entry & DESC_VALID == 0 {
                return false;
            }
            if level == LEVELS - 1 {
                write_entry(table, index, 0);
                return true;
            }
            let subtable = PhysicalAddress::new(entry & ADDR_MASK);
            let ok = Self::unmap_walk(subtable, level + 1, virt);
            if ok && Self::table_empty(subtable) {
                write_entry(table, index, 0);
                PAGE_ALLOCATOR.lock().free_region(subtable);
            }
            ok
        }

        fn table_empty(table: PhysicalAddress) -> bool {
            (0..ENTRIES_PER_TABLE).all(|i| read_entry(table, i) & DESC_VALID == 0)
        }

        fn free_tree(table: PhysicalAddress, level: usize) {
            if level < LEVELS - 1 {
                for index in 0..ENTRIES_PER_TABLE {
                    let entry = read_entry(table, index);
                    if entry & DESC_VALID != 0 {
                        Self::free_tree(PhysicalAddress::new(entry & ADDR_MASK), level + 1);
                    }
                }
            }
            PAGE_ALLOCATOR.lock().free_region(table);
        }
    }

    impl Drop for TableManager {
        fn drop(&mut self) {
            Self::free_tree(self.root, 0);
        }
    }
}

#[cfg(not(target_os = "none"))]
mod hw {
    use alloc::collections::BTreeMap;

    use super::*;

    /// Host-side stand-in recording mappings so the space manager and its
    /// tests exercise the same call paths as on hardware.
    pub struct TableManager {
        mappings: BTreeMap<usize, (u64, MappingAttributes, MemoryType)>,
    }

    impl TableManager {
        pub fn create() -> Option<Self> {
            Some(Self {
                mappings: BTreeMap::new(),
            })
        }

        pub fn raw_root_ptr(&self) -> u64 {
            0
        }

        pub fn map_region(
            &mut self,
            virt: usize,
            phys: PhysicalAddress,
            size: usize,
            attrs: MappingAttributes,
            memtype: MemoryType,
        ) -> bool {
            if virt % PAGE_SIZE != 0 || phys.page_offset() != 0 || size % PAGE_SIZE != 0 {
                return false;
            }
            let pages = size / PAGE_SIZE;
            if (0..pages).any(|p| self.mappings.contains_key(&(virt + p * PAGE_SIZE))) {
                return false;
            }
            for p in 0..pages {
                self.mappings.insert(
                    virt + p * PAGE_SIZE,
                    (phys.get() + (p * PAGE_SIZE) as u64, attrs, memtype),
                );
            }
            true
        }

        pub fn unmap_region(&mut self, virt: usize, size: usize) -> bool {
            if virt % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
                return false;
            }
            let mut ok = true;
            for p in 0..size / PAGE_SIZE {
                ok &= self.mappings.remove(&(virt + p * PAGE_SIZE)).is_some();
            }
            ok
        }
    }
}

pub use hw::TableManager;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::MemoryOperation;

    #[test]
    fn remap_requires_unmap() {
        let mut tables = TableManager::create().unwrap();
        let attrs = MappingAttributes::user(MemoryOperation::READ);
        let phys = PhysicalAddress::new(0x8000_0000);
        assert!(tables.map_region(0x10000, phys, 2 * PAGE_SIZE, attrs, MemoryType::NormalRam));
        // Overlapping remap fails.
        assert!(!tables.map_region(0x11000, phys, PAGE_SIZE, attrs, MemoryType::NormalRam));
        // Unmap then remap succeeds.
        assert!(tables.unmap_region(0x10000, 2 * PAGE_SIZE));
        assert!(tables.map_region(0x10000, phys, 2 * PAGE_SIZE, attrs, MemoryType::NormalRam));
    }

    #[test]
    fn unaligned_requests_rejected() {
        let mut tables = TableManager::create().unwrap();
        let attrs = MappingAttributes::user(MemoryOperation::READ);
        assert!(!tables.map_region(
            0x10001,
            PhysicalAddress::new(0x8000_0000),
            PAGE_SIZE,
            attrs,
            MemoryType::NormalRam
        ));
        assert!(!tables.unmap_region(0x10000, 123));
    }
}
