//! Virtio block device driver.
//!
//! Implements the asynchronous [`BlockDevice`] contract over a virtio-mmio
//! transport: one request queue, 512-byte sectors, each request a
//! three-element descriptor chain (header out, data in/out, status in).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::blockdev::{
    self, BlockDevice, TransferCompletion, TransferResult,
};
use crate::buffer::Pod;
use crate::error::SysResult;

use super::mmio::{MmioTransport, STANDARD_FEAT_REQUIRED, STANDARD_FEAT_SUPPORTED};
use super::queue::{Direction, TransferElement};
use super::virt_to_dma;

/// Sector unit of the virtio-blk protocol, independent of any advertised
/// block size.
const VIRTIO_BLK_SECTOR: u64 = 512;

// Device feature bits.
const FEAT_RO: u64 = 1 << 5;

// Request types.
const REQ_IN: u32 = 0;
const REQ_OUT: u32 = 1;

// Status byte values written by the device.
const STATUS_OK: u8 = 0;
/// Initial value, never written by a conforming device.
const STATUS_UNSET: u8 = 0xFF;

// Config space offsets.
const CONFIG_CAPACITY: usize = 0x00;

#[repr(C)]
#[derive(Clone, Copy)]
struct BlkRequestHeader {
    request_type: u32,
    reserved: u32,
    sector: u64,
}

// SAFETY: repr(C), no padding surprises, any bit pattern valid.
unsafe impl Pod for BlkRequestHeader {}

pub struct VirtioBlockDevice {
    transport: Arc<MmioTransport>,
    capacity_bytes: u64,
    read_only: bool,
}

impl VirtioBlockDevice {
    /// Bring up a block device on `transport` and register it with the
    /// block device registry.
    pub fn create(transport: Arc<MmioTransport>) -> SysResult<()> {
        let features = transport
            .configure_features(STANDARD_FEAT_REQUIRED, STANDARD_FEAT_SUPPORTED | FEAT_RO)?;
        let capacity_sectors = transport.config_read_u64(CONFIG_CAPACITY);
        transport.setup_vqueue(0)?;
        transport.finish_init();

        let device = Arc::new(Self {
            transport,
            capacity_bytes: capacity_sectors * VIRTIO_BLK_SECTOR,
            read_only: features & FEAT_RO != 0,
        });
        log::info!(
            "virtio-blk: {} KiB{}",
            device.capacity_bytes / 1024,
            if device.read_only { ", read-only" } else { "" }
        );
        blockdev::register_raw_device("virtio.disk", device);
        Ok(())
    }

    fn schedule(
        &self,
        request_type: u32,
        byte_offset: u64,
        buffer: Vec<u8>,
        completion: TransferCompletion,
    ) {
        if let Some(fail) = blockdev::validate_transfer(self, byte_offset, buffer.len()) {
            completion(fail, buffer);
            return;
        }

        let header = Box::new(BlkRequestHeader {
            request_type,
            reserved: 0,
            sector: byte_offset / VIRTIO_BLK_SECTOR,
        });
        let status = Box::new(STATUS_UNSET);

        let data_direction = if request_type == REQ_IN {
            Direction::In
        } else {
            Direction::Out
        };
        let elements = [
            TransferElement {
                direction: Direction::Out,
                phys_addr: virt_to_dma(&*header as *const BlkRequestHeader as *const u8),
                length: core::mem::size_of::<BlkRequestHeader>() as u32,
            },
            TransferElement {
                direction: data_direction,
                phys_addr: virt_to_dma(buffer.as_ptr()),
                length: buffer.len() as u32,
            },
            TransferElement {
                direction: Direction::In,
                phys_addr: virt_to_dma(&*status as *const u8),
                length: 1,
            },
        ];

        // The callback owns every piece of the request, keeping the DMA
        // targets alive until the device is done with them. A failed
        // submit hands the callback back; invoking it then reports
        // Failure through the untouched status byte.
        let callback = Box::new(move |_written: u32| {
            let result = if *status == STATUS_OK {
                TransferResult::Success
            } else {
                TransferResult::Failure
            };
            drop(header);
            completion(result, buffer);
        });

        if let Err((error, callback)) = self.transport.queue_transfer(0, &elements, callback) {
            log::warn!("virtio-blk: submit failed: {}", error);
            callback(0);
        }
    }
}

impl BlockDevice for VirtioBlockDevice {
    fn logical_block_size(&self) -> usize {
        VIRTIO_BLK_SECTOR as usize
    }

    fn capacity(&self) -> u64 {
        self.capacity_bytes
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn schedule_read(&self, byte_offset: u64, buffer: Vec<u8>, completion: TransferCompletion) {
        self.schedule(REQ_IN, byte_offset, buffer, completion);
    }

    fn schedule_write(&self, byte_offset: u64, buffer: Vec<u8>, completion: TransferCompletion) {
        if self.read_only {
            completion(TransferResult::ReadOnly, buffer);
            return;
        }
        self.schedule(REQ_OUT, byte_offset, buffer, completion);
    }
}
