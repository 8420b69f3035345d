//! Memory management for bekOS.
//!
//! Layering, leaves first: the kernel heap (a linked-list allocator over a
//! fixed early region), the bitmap physical page allocator, the 4-level
//! translation-table manager, backing regions, and the per-process space
//! manager.

pub mod backing;
pub mod heap;
pub mod page_allocator;
pub mod page_table;
pub mod space;

pub use backing::{BackingRegion, DeviceBackedRegion, UserOwnedAllocation};
pub use page_allocator::PAGE_ALLOCATOR;
pub use page_table::TableManager;
pub use space::{SpaceManager, UserspaceRegion};

use alloc::vec::Vec;

use bitflags::bitflags;

/// Size of a page / physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Base of the kernel half of the address space; physical memory is mapped
/// linearly starting here.
pub const KERNEL_VADDR_BASE: usize = 0xFFFF_0000_0000_0000;

/// Exclusive top of the userspace half.
pub const USER_VADDR_TOP: usize = 0x0000_8000_0000_0000;

/// Lowest address handed to userspace; keeps the null page unmapped.
pub const USER_VADDR_BASE: usize = 0x1000;

bitflags! {
    /// Operations a userspace mapping may permit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryOperation: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

/// Memory type programmed into a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Cacheable normal RAM.
    NormalRam,
    /// Device-nGnRE ordered MMIO.
    Mmio,
}

/// Opaque 64-bit physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn page_offset(&self) -> usize {
        (self.0 as usize) % PAGE_SIZE
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Kernel-virtual alias of this physical address in the linear map.
    pub const fn to_kernel_virt(&self) -> VirtualAddress {
        VirtualAddress(self.0 as usize + KERNEL_VADDR_BASE)
    }
}

/// Opaque kernel or user virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub usize);

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn get(&self) -> usize {
        self.0
    }

    pub const fn offset(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Physical address behind a linear-map kernel address.
    pub const fn to_physical(&self) -> Option<PhysicalAddress> {
        if self.0 >= KERNEL_VADDR_BASE {
            Some(PhysicalAddress((self.0 - KERNEL_VADDR_BASE) as u64))
        } else {
            None
        }
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

macro_rules! region_type {
    ($(#[$doc:meta])* $name:ident, $addr:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub start: $addr,
            pub size: usize,
        }

        impl $name {
            pub const fn new(start: $addr, size: usize) -> Self {
                Self { start, size }
            }

            pub fn end(&self) -> $addr {
                self.start.offset(self.size as _)
            }

            pub fn page_aligned(&self) -> bool {
                (self.start.get() as usize) % PAGE_SIZE == 0 && self.size % PAGE_SIZE == 0
            }

            pub fn contains(&self, addr: $addr) -> bool {
                self.start <= addr && addr < self.end()
            }

            pub fn contains_range(&self, addr: $addr, size: usize) -> bool {
                self.start <= addr && (addr.get() as u128) + size as u128 <= self.end().get() as u128
            }

            pub fn overlaps(&self, other: &$name) -> bool {
                self.start < other.end() && other.start < self.end()
            }

            /// Overlap of two regions; zero-sized when disjoint.
            pub fn intersection(&self, other: &$name) -> $name {
                let start = if self.start > other.start { self.start } else { other.start };
                let end = if self.end() < other.end() { self.end() } else { other.end() };
                if start.get() >= end.get() {
                    $name { start, size: 0 }
                } else {
                    $name { start, size: (end.get() - start.get()) as usize }
                }
            }
        }
    };
}

region_type!(
    /// A region of physical memory.
    PhysicalRegion,
    PhysicalAddress
);
region_type!(
    /// A region of kernel virtual memory.
    VirtualRegion,
    VirtualAddress
);
region_type!(
    /// A region of userspace virtual memory.
    UserRegion,
    VirtualAddress
);

/// Classification of a physical region discovered at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Memory,
    Reserved,
    Unknown,
}

/// A physical region annotated with its boot-time classification.
#[derive(Debug, Clone, Copy)]
pub struct AnnotatedRegion {
    pub region: PhysicalRegion,
    pub kind: RegionKind,
}

/// Normalise the device tree's `memory` and `reserved-memory` ranges into
/// an ordered, non-overlapping cover of the physical address space.
///
/// Reserved ranges take priority where they overlap memory; gaps become
/// `Unknown`.
pub fn process_memory_regions(
    mem_regions: &[PhysicalRegion],
    reserved_regions: &[PhysicalRegion],
) -> Vec<AnnotatedRegion> {
    let mut remaining = PhysicalRegion::new(PhysicalAddress::new(0), 1usize << 48);
    let mut regions = Vec::new();

    while remaining.size != 0 {
        let mut next = AnnotatedRegion {
            region: PhysicalRegion::new(PhysicalAddress::new(u64::MAX), 0),
            kind: RegionKind::Unknown,
        };
        for region in reserved_regions {
            let intersection = remaining.intersection(region);
            if intersection.size != 0 && intersection.start < next.region.start {
                next.region = intersection;
                next.kind = RegionKind::Reserved;
            }
        }
        for region in mem_regions {
            let mut intersection = remaining.intersection(region);
            if intersection.size != 0 && intersection.start < next.region.start {
                if intersection.end() > next.region.start {
                    // Truncate at the reserved region that follows.
                    intersection.size = (next.region.start.get() - intersection.start.get()) as usize;
                }
                next.region = intersection;
                next.kind = RegionKind::Memory;
            }
        }

        if next.region.size != 0 {
            if next.region.start != remaining.start {
                regions.push(AnnotatedRegion {
                    region: PhysicalRegion::new(
                        remaining.start,
                        (next.region.start.get() - remaining.start.get()) as usize,
                    ),
                    kind: RegionKind::Unknown,
                });
            }
            regions.push(next);
            remaining.size -= (next.region.end().get() - remaining.start.get()) as usize;
            remaining.start = next.region.end();
        } else {
            regions.push(AnnotatedRegion {
                region: remaining,
                kind: RegionKind::Unknown,
            });
            remaining.start = remaining.end();
            remaining.size = 0;
        }
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn pr(start: u64, size: usize) -> PhysicalRegion {
        PhysicalRegion::new(PhysicalAddress::new(start), size)
    }

    #[test]
    fn region_overlap_and_intersection() {
        let a = pr(0x1000, 0x2000);
        let b = pr(0x2000, 0x2000);
        let c = pr(0x4000, 0x1000);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        let i = a.intersection(&b);
        assert_eq!(i.start.get(), 0x2000);
        assert_eq!(i.size, 0x1000);
        assert_eq!(a.intersection(&c).size, 0);
    }

    #[test]
    fn memory_regions_cover_and_classify() {
        let memory = [pr(0x4000_0000, 0x4000_0000)];
        let reserved = [pr(0x4800_0000, 0x10_0000)];
        let annotated = process_memory_regions(&memory, &reserved);

        // Coverage is contiguous from 0 to 2^48.
        let mut cursor = 0u64;
        for region in &annotated {
            assert_eq!(region.region.start.get(), cursor);
            cursor = region.region.end().get();
        }
        assert_eq!(cursor, 1u64 << 48);

        // The reserved carve-out splits the memory region in two.
        let memory_parts: Vec<_> = annotated
            .iter()
            .filter(|r| r.kind == RegionKind::Memory)
            .collect();
        assert_eq!(memory_parts.len(), 2);
        assert_eq!(memory_parts[0].region.end().get(), 0x4800_0000);
        assert_eq!(memory_parts[1].region.start.get(), 0x4810_0000);
        let reserved_parts: Vec<_> = annotated
            .iter()
            .filter(|r| r.kind == RegionKind::Reserved)
            .collect();
        assert_eq!(reserved_parts.len(), 1);
        assert_eq!(reserved_parts[0].region.size, 0x10_0000);
    }
}
