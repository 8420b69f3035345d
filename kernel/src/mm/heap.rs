//! Kernel heap bring-up.
//!
//! The heap is a linked-list allocator over a fixed early region reserved
//! by the boot path, and comes up before the physical page allocator so
//! that the allocator's own bookkeeping can live on the heap.

use super::VirtualRegion;

/// Hand the early heap region to the global allocator.
///
/// # Safety
///
/// `region` must be mapped, writable, unused by anything else, and must
/// never be handed out again. Must be called exactly once, before any
/// allocation.
#[cfg(target_os = "none")]
pub unsafe fn init(region: VirtualRegion) {
    // SAFETY: forwarded contract; the region is exclusively owned by the
    // allocator from here on.
    unsafe {
        crate::heap_allocator()
            .lock()
            .init(region.start.as_mut_ptr::<u8>(), region.size);
    }
}

/// Host builds use the system allocator; nothing to initialise.
#[cfg(not(target_os = "none"))]
pub unsafe fn init(_region: VirtualRegion) {}
