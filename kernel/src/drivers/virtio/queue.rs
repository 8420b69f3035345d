//! Split virtqueue.
//!
//! Three physically contiguous regions: the descriptor table, the
//! available ring, and the (page-aligned) used ring. Free descriptors form
//! a singly-linked list threaded through their `next` fields with the
//! queue size as end sentinel. Completion callbacks are stored keyed by
//! the head descriptor index of each submitted chain and invoked exactly
//! once when the device returns the chain through the used ring.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use core::sync::atomic::{fence, Ordering};

use crate::error::{SysError, SysResult};
use crate::mm::PAGE_SIZE;
use crate::utils::align_up;

/// Largest queue size this kernel will program, regardless of what the
/// device offers.
pub const MAX_QUEUE_SIZE: u16 = 32;

pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;

/// Descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VqUsedElem {
    id: u32,
    len: u32,
}

/// Direction of one element of a transfer, from the device's viewpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device writes into the buffer.
    In,
    /// Device reads from the buffer.
    Out,
}

/// One physically contiguous piece of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferElement {
    pub direction: Direction,
    pub phys_addr: u64,
    pub length: u32,
}

/// Completion callback, invoked once with the number of bytes the device
/// wrote into the chain.
pub type VqCallback = Box<dyn FnOnce(u32) + Send>;

/// Backing storage for the three rings.
///
/// On bare metal this is a run of DMA-able pages from the physical
/// allocator; on the host a heap allocation with a fake physical address,
/// so ring logic is testable.
struct VqMemory {
    base: *mut u8,
    phys_base: u64,
    #[cfg(target_os = "none")]
    pages: usize,
    #[cfg(not(target_os = "none"))]
    _storage: Box<[u8]>,
}

// SAFETY: the allocation is exclusively owned; pointers never move.
unsafe impl Send for VqMemory {}

impl VqMemory {
    fn allocate(total_size: usize) -> SysResult<Self> {
        #[cfg(target_os = "none")]
        {
            let pages = total_size.div_ceil(PAGE_SIZE);
            let region = crate::mm::PAGE_ALLOCATOR
                .lock()
                .allocate_region(pages)
                .ok_or(SysError::OutOfMemory)?;
            let base = region.start.to_kernel_virt().as_mut_ptr::<u8>();
            // SAFETY: freshly allocated linear-mapped pages, exclusively
            // owned.
            unsafe { core::ptr::write_bytes(base, 0, pages * PAGE_SIZE) };
            Ok(Self {
                base,
                phys_base: region.start.get(),
                pages,
            })
        }
        #[cfg(not(target_os = "none"))]
        {
            let mut storage = alloc::vec![0u8; total_size + PAGE_SIZE].into_boxed_slice();
            let unaligned = storage.as_mut_ptr() as usize;
            let aligned = align_up(unaligned, PAGE_SIZE);
            Ok(Self {
                base: aligned as *mut u8,
                phys_base: aligned as u64,
                _storage: storage,
            })
        }
    }
}

#[cfg(target_os = "none")]
impl Drop for VqMemory {
    fn drop(&mut self) {
        let _ = self.pages;
        crate::mm::PAGE_ALLOCATOR
            .lock()
            .free_region(crate::mm::PhysicalAddress::new(self.phys_base));
    }
}

pub struct SplitVq {
    size: u16,
    memory: VqMemory,
    avail_offset: usize,
    used_offset: usize,
    next_free_desc: u16,
    free_count: u16,
    last_seen_used_idx: u16,
    callbacks: BTreeMap<u16, VqCallback>,
}

impl SplitVq {
    /// Build a queue of `size` entries (a power of two ≤
    /// [`MAX_QUEUE_SIZE`]).
    pub fn new(size: u16) -> SysResult<Self> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return Err(SysError::InvalidArgument);
        }
        let desc_size = 16 * size as usize;
        let avail_size = 6 + 2 * size as usize;
        let used_offset = align_up(desc_size + avail_size, PAGE_SIZE);
        let used_size = 6 + 8 * size as usize;
        let memory = VqMemory::allocate(used_offset + used_size)?;

        let mut vq = Self {
            size,
            memory,
            avail_offset: desc_size,
            used_offset,
            next_free_desc: 0,
            free_count: size,
            last_seen_used_idx: 0,
            callbacks: BTreeMap::new(),
        };
        // Thread the free list; `size` is the end sentinel.
        for i in 0..size {
            vq.write_desc(i, VqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: i + 1,
            });
        }
        Ok(vq)
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn free_descriptors(&self) -> u16 {
        self.free_count
    }

    pub fn phys_desc(&self) -> u64 {
        self.memory.phys_base
    }

    pub fn phys_avail(&self) -> u64 {
        self.memory.phys_base + self.avail_offset as u64
    }

    pub fn phys_used(&self) -> u64 {
        self.memory.phys_base + self.used_offset as u64
    }

    fn desc_ptr(&self, index: u16) -> *mut VqDesc {
        debug_assert!(index < self.size);
        // Pointer arithmetic stays inside the descriptor table.
        self.memory.base.wrapping_add(16 * index as usize) as *mut VqDesc
    }

    fn read_desc(&self, index: u16) -> VqDesc {
        // SAFETY: desc_ptr stays inside the owned allocation.
        unsafe { self.desc_ptr(index).read_volatile() }
    }

    fn write_desc(&mut self, index: u16, desc: VqDesc) {
        // SAFETY: as in read_desc.
        unsafe { self.desc_ptr(index).write_volatile(desc) }
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        self.memory.base.wrapping_add(self.avail_offset + 2) as *mut u16
    }

    fn avail_ring_ptr(&self, slot: u16) -> *mut u16 {
        self.memory
            .base
            .wrapping_add(self.avail_offset + 4 + 2 * slot as usize) as *mut u16
    }

    fn used_idx(&self) -> u16 {
        // SAFETY: inside the owned allocation; the device updates this
        // field, hence volatile.
        unsafe {
            (self.memory.base.wrapping_add(self.used_offset + 2) as *const u16).read_volatile()
        }
    }

    fn used_elem(&self, slot: u16) -> VqUsedElem {
        // SAFETY: as in used_idx.
        unsafe {
            (self
                .memory
                .base
                .wrapping_add(self.used_offset + 4 + 8 * slot as usize)
                as *const VqUsedElem)
                .read_volatile()
        }
    }

    fn allocate_descriptor(&mut self) -> Option<u16> {
        if self.next_free_desc >= self.size {
            return None;
        }
        let index = self.next_free_desc;
        self.next_free_desc = self.read_desc(index).next;
        self.free_count -= 1;
        Some(index)
    }

    fn free_chain(&mut self, head: u16) {
        let mut tail = head;
        let mut freed = 1u16;
        loop {
            let desc = self.read_desc(tail);
            if desc.flags & DESC_F_NEXT == 0 {
                break;
            }
            tail = desc.next;
            freed += 1;
        }
        // Splice the whole chain onto the front of the free list.
        let mut desc = self.read_desc(tail);
        desc.next = self.next_free_desc;
        self.write_desc(tail, desc);
        self.next_free_desc = head;
        self.free_count += freed;
    }

    /// Build a descriptor chain for `elements`, publish it to the
    /// available ring, and record `callback` under the chain head.
    ///
    /// The caller must notify the device afterwards. Fails with `TryAgain`
    /// when not enough descriptors are free; no state changes in that
    /// case, and the callback is handed back so the caller can still
    /// honour its exactly-once contract.
    pub fn submit_transfer(
        &mut self,
        elements: &[TransferElement],
        callback: VqCallback,
    ) -> Result<u16, (SysError, VqCallback)> {
        if elements.is_empty() {
            return Err((SysError::InvalidArgument, callback));
        }
        if (self.free_count as usize) < elements.len() {
            return Err((SysError::TryAgain, callback));
        }

        let mut indices = [0u16; MAX_QUEUE_SIZE as usize];
        for (i, _) in elements.iter().enumerate() {
            indices[i] = self
                .allocate_descriptor()
                .expect("free_count said descriptors were available");
        }
        for (i, element) in elements.iter().enumerate() {
            let last = i + 1 == elements.len();
            let mut flags = match element.direction {
                Direction::In => DESC_F_WRITE,
                Direction::Out => 0,
            };
            if !last {
                flags |= DESC_F_NEXT;
            }
            self.write_desc(indices[i], VqDesc {
                addr: element.phys_addr,
                len: element.length,
                flags,
                next: if last { self.size } else { indices[i + 1] },
            });
        }

        let head = indices[0];
        self.callbacks.insert(head, callback);

        // SAFETY: slot pointer is inside the available ring.
        let avail_idx = unsafe { self.avail_idx_ptr().read_volatile() };
        // SAFETY: as above.
        unsafe {
            self.avail_ring_ptr(avail_idx % self.size).write_volatile(head);
        }
        // Publish: descriptor and ring-slot writes must be visible before
        // the index moves.
        fence(Ordering::Release);
        // SAFETY: as above.
        unsafe {
            self.avail_idx_ptr().write_volatile(avail_idx.wrapping_add(1));
        }
        Ok(head)
    }

    /// Consume completions: advance over the used ring, return each chain
    /// to the free list and invoke its callback with the written length.
    pub fn process_used(&mut self) {
        // Observe: the index read must complete before the entries are
        // read.
        fence(Ordering::Acquire);
        while self.last_seen_used_idx != self.used_idx() {
            let slot = self.last_seen_used_idx % self.size;
            let elem = self.used_elem(slot);
            self.last_seen_used_idx = self.last_seen_used_idx.wrapping_add(1);

            let head = elem.id as u16;
            self.free_chain(head);
            if let Some(callback) = self.callbacks.remove(&head) {
                callback(elem.len);
            } else {
                log::warn!("virtio: completion for head {} with no callback", head);
            }
        }
    }

    /// Pending-completion check without consuming.
    pub fn has_used(&self) -> bool {
        fence(Ordering::Acquire);
        self.last_seen_used_idx != self.used_idx()
    }

    /// Test hook: pretend the device completed the chain at `head` having
    /// written `len` bytes.
    #[cfg(test)]
    pub fn test_complete(&mut self, head: u16, len: u32) {
        let idx = self.used_idx();
        let slot = idx % self.size;
        // SAFETY: inside the owned allocation (test builds only).
        unsafe {
            (self
                .memory
                .base
                .wrapping_add(self.used_offset + 4 + 8 * slot as usize)
                as *mut VqUsedElem)
                .write_volatile(VqUsedElem {
                    id: head as u32,
                    len,
                });
            (self.memory.base.wrapping_add(self.used_offset + 2) as *mut u16)
                .write_volatile(idx.wrapping_add(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn element(direction: Direction, len: u32) -> TransferElement {
        TransferElement {
            direction,
            phys_addr: 0x1000,
            length: len,
        }
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(SplitVq::new(0).is_err());
        assert!(SplitVq::new(3).is_err());
        assert!(SplitVq::new(64).is_err());
        assert!(SplitVq::new(32).is_ok());
    }

    #[test]
    fn submit_complete_roundtrip() {
        static WRITTEN: AtomicU32 = AtomicU32::new(0);
        let mut vq = SplitVq::new(8).unwrap();
        assert_eq!(vq.free_descriptors(), 8);

        let head = vq
            .submit_transfer(
                &[
                    element(Direction::Out, 16),
                    element(Direction::In, 512),
                    element(Direction::In, 1),
                ],
                Box::new(|len| {
                    WRITTEN.store(len, AtomicOrdering::Relaxed);
                }),
            )
            .map_err(|(e, _)| e).unwrap();
        assert_eq!(vq.free_descriptors(), 5);
        assert!(!vq.has_used());

        vq.test_complete(head, 513);
        assert!(vq.has_used());
        vq.process_used();
        // Callback ran exactly once and every descriptor returned.
        assert_eq!(WRITTEN.load(AtomicOrdering::Relaxed), 513);
        assert_eq!(vq.free_descriptors(), 8);
        assert!(!vq.has_used());
    }

    #[test]
    fn exhaustion_returns_try_again() {
        let mut vq = SplitVq::new(4).unwrap();
        let elements = [element(Direction::Out, 8); 3];
        let head = vq
            .submit_transfer(&elements, Box::new(|_| ()))
            .map_err(|(e, _)| e).unwrap();
        assert_eq!(vq.free_descriptors(), 1);
        let (error, returned_callback) =
            vq.submit_transfer(&elements, Box::new(|_| ())).unwrap_err();
        assert_eq!(error, SysError::TryAgain);
        returned_callback(0);
        // Nothing leaked by the failed submit.
        assert_eq!(vq.free_descriptors(), 1);

        vq.test_complete(head, 0);
        vq.process_used();
        assert_eq!(vq.free_descriptors(), 4);
        vq.submit_transfer(&elements, Box::new(|_| ())).map_err(|(e, _)| e).unwrap();
    }

    #[test]
    fn chains_recycle_in_any_order() {
        let mut vq = SplitVq::new(8).unwrap();
        let a = vq
            .submit_transfer(&[element(Direction::Out, 1); 2], Box::new(|_| ()))
            .map_err(|(e, _)| e).unwrap();
        let b = vq
            .submit_transfer(&[element(Direction::In, 1); 3], Box::new(|_| ()))
            .map_err(|(e, _)| e).unwrap();
        // Complete out of submission order.
        vq.test_complete(b, 3);
        vq.test_complete(a, 0);
        vq.process_used();
        assert_eq!(vq.free_descriptors(), 8);
    }
}
