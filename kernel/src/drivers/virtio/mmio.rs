//! Virtio-mmio transport (virtio 1.x, register version 2).
//!
//! Owns the register window and the per-queue [`SplitVq`]s; device class
//! drivers (blk, fb) layer their request formats on top.

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{SysError, SysResult};
use crate::mm::VirtualAddress;

use super::queue::{SplitVq, TransferElement, VqCallback, MAX_QUEUE_SIZE};

// Register offsets.
const REG_MAGIC: usize = 0x00;
const REG_VERSION: usize = 0x04;
const REG_DEVICE_ID: usize = 0x08;
const REG_DEV_FEATURES: usize = 0x10;
const REG_DEV_FEATURES_SEL: usize = 0x14;
const REG_DRV_FEATURES: usize = 0x20;
const REG_DRV_FEATURES_SEL: usize = 0x24;
const REG_QUEUE_SEL: usize = 0x30;
const REG_QUEUE_NUM_MAX: usize = 0x34;
const REG_QUEUE_NUM: usize = 0x38;
const REG_QUEUE_READY: usize = 0x44;
const REG_QUEUE_NOTIFY: usize = 0x50;
const REG_INTERRUPT_STATUS: usize = 0x60;
const REG_INTERRUPT_ACK: usize = 0x64;
const REG_STATUS: usize = 0x70;
const REG_QUEUE_DESC: usize = 0x80;
const REG_QUEUE_DRIVER: usize = 0x90;
const REG_QUEUE_DEVICE: usize = 0xA0;
/// Device-specific config space starts here.
const REG_CONFIG: usize = 0x100;

const MAGIC_VALUE: u32 = 0x7472_6976; // "virt", little-endian.
const MMIO_VERSION: u32 = 2;

const STATUS_ACK: u32 = 1;
const STATUS_DRIVER: u32 = 2;
const STATUS_DRIVER_OK: u32 = 4;
const STATUS_FEATURES_OK: u32 = 8;
const STATUS_FAILED: u32 = 128;

const INT_USED_RING: u32 = 1;

/// Standard feature bits.
pub const FEAT_INDIRECT: u64 = 1 << 28;
pub const FEAT_VERSION_1: u64 = 1 << 32;
pub const FEAT_ACCESS_PLATFORM: u64 = 1 << 33;
pub const FEAT_RING_PACKED: u64 = 1 << 34;

/// Features this transport understands beyond what a device class
/// requires.
pub const STANDARD_FEAT_SUPPORTED: u64 =
    FEAT_INDIRECT | FEAT_VERSION_1 | FEAT_ACCESS_PLATFORM | FEAT_RING_PACKED;
/// Features every device must offer.
pub const STANDARD_FEAT_REQUIRED: u64 = FEAT_VERSION_1;

/// Device class ids this kernel drives.
pub const DEVICE_ID_BLOCK: u32 = 2;
pub const DEVICE_ID_GPU: u32 = 16;

pub struct MmioTransport {
    base: VirtualAddress,
    queues: Mutex<Vec<Option<SplitVq>>>,
}

// SAFETY: register window is fixed; queues are mutex-guarded; MMIO
// accesses are individually volatile.
unsafe impl Send for MmioTransport {}
// SAFETY: as above.
unsafe impl Sync for MmioTransport {}

impl MmioTransport {
    /// Wrap a register window, verifying magic and version.
    ///
    /// # Safety
    ///
    /// `base` must be the kernel-virtual alias of a mapped virtio-mmio
    /// register block.
    pub unsafe fn new(base: VirtualAddress) -> SysResult<Self> {
        let transport = Self {
            base,
            queues: Mutex::new(Vec::new()),
        };
        if transport.read_reg(REG_MAGIC) != MAGIC_VALUE {
            return Err(SysError::NoSuchDevice);
        }
        if transport.read_reg(REG_VERSION) != MMIO_VERSION {
            log::warn!("virtio: legacy register layout not supported");
            return Err(SysError::NotSupported);
        }
        Ok(transport)
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: mapped register window per constructor contract.
        unsafe { self.base.offset(offset).as_ptr::<u32>().read_volatile() }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // SAFETY: as in read_reg.
        unsafe {
            self.base
                .offset(offset)
                .as_mut_ptr::<u32>()
                .write_volatile(value)
        }
    }

    fn write_reg_u64(&self, offset: usize, value: u64) {
        // 64-bit registers are written as two u32 halves, low first.
        self.write_reg(offset, value as u32);
        self.write_reg(offset + 4, (value >> 32) as u32);
    }

    pub fn device_id(&self) -> u32 {
        self.read_reg(REG_DEVICE_ID)
    }

    /// Device-specific config read.
    pub fn config_read_u32(&self, offset: usize) -> u32 {
        self.read_reg(REG_CONFIG + offset)
    }

    pub fn config_read_u64(&self, offset: usize) -> u64 {
        let low = self.config_read_u32(offset) as u64;
        let high = self.config_read_u32(offset + 4) as u64;
        (high << 32) | low
    }

    fn read_device_features(&self) -> u64 {
        self.write_reg(REG_DEV_FEATURES_SEL, 0);
        let low = self.read_reg(REG_DEV_FEATURES) as u64;
        self.write_reg(REG_DEV_FEATURES_SEL, 1);
        let high = self.read_reg(REG_DEV_FEATURES) as u64;
        (high << 32) | low
    }

    fn write_driver_features(&self, features: u64) {
        self.write_reg(REG_DRV_FEATURES_SEL, 0);
        self.write_reg(REG_DRV_FEATURES, features as u32);
        self.write_reg(REG_DRV_FEATURES_SEL, 1);
        self.write_reg(REG_DRV_FEATURES, (features >> 32) as u32);
    }

    /// Reset, acknowledge, and negotiate features.
    ///
    /// The accepted set is `device ∩ (required ∪ supported)`; missing
    /// `required` bits or a device that rejects `FEATURES_OK` abort the
    /// bring-up with the FAILED status bit set.
    pub fn configure_features(&self, required: u64, supported: u64) -> SysResult<u64> {
        self.write_reg(REG_STATUS, 0);
        self.write_reg(REG_STATUS, STATUS_ACK | STATUS_DRIVER);

        let offered = self.read_device_features();
        if offered & required != required {
            log::warn!(
                "virtio: device lacks required features ({:#x} of {:#x})",
                offered & required,
                required
            );
            self.write_reg(REG_STATUS, STATUS_FAILED);
            return Err(SysError::NotSupported);
        }
        let accepted = offered & (required | supported);
        self.write_driver_features(accepted);

        let status = self.read_reg(REG_STATUS) | STATUS_FEATURES_OK;
        self.write_reg(REG_STATUS, status);
        if self.read_reg(REG_STATUS) & STATUS_FEATURES_OK == 0 {
            log::warn!("virtio: device rejected negotiated features {:#x}", accepted);
            self.write_reg(REG_STATUS, STATUS_FAILED);
            return Err(SysError::NotSupported);
        }
        Ok(accepted)
    }

    /// Create and register queue `index` with the device.
    pub fn setup_vqueue(&self, index: u32) -> SysResult<()> {
        self.write_reg(REG_QUEUE_SEL, index);
        let _irq = crate::arch::interrupt_guard();
        let max = self.read_reg(REG_QUEUE_NUM_MAX);
        if max == 0 {
            return Err(SysError::NoSuchDevice);
        }
        let size = (max.min(MAX_QUEUE_SIZE as u32) as u16).next_power_of_two().min(MAX_QUEUE_SIZE);
        let size = if size as u32 > max { size / 2 } else { size };
        let vq = SplitVq::new(size)?;

        self.write_reg(REG_QUEUE_NUM, size as u32);
        self.write_reg_u64(REG_QUEUE_DESC, vq.phys_desc());
        self.write_reg_u64(REG_QUEUE_DRIVER, vq.phys_avail());
        self.write_reg_u64(REG_QUEUE_DEVICE, vq.phys_used());
        self.write_reg(REG_QUEUE_READY, 1);

        let mut queues = self.queues.lock();
        if queues.len() <= index as usize {
            queues.resize_with(index as usize + 1, || None);
        }
        queues[index as usize] = Some(vq);
        Ok(())
    }

    /// Mark driver bring-up complete.
    pub fn finish_init(&self) {
        let status = self.read_reg(REG_STATUS) | STATUS_DRIVER_OK;
        self.write_reg(REG_STATUS, status);
    }

    /// Submit `elements` on queue `index` and notify the device;
    /// `callback` fires from interrupt context on completion. On failure
    /// the callback is handed back so the caller can report the error
    /// through it.
    pub fn queue_transfer(
        &self,
        index: u32,
        elements: &[TransferElement],
        callback: VqCallback,
    ) -> Result<(), (SysError, VqCallback)> {
        {
            // The interrupt path also takes the queue lock.
            let _irq = crate::arch::interrupt_guard();
            let mut queues = self.queues.lock();
            let Some(vq) = queues.get_mut(index as usize).and_then(|q| q.as_mut()) else {
                return Err((SysError::InvalidArgument, callback));
            };
            vq.submit_transfer(elements, callback)?;
        }
        self.write_reg(REG_QUEUE_NOTIFY, index);
        Ok(())
    }

    /// Interrupt entry: on a used-ring notification, acknowledge and run
    /// completions on every queue.
    pub fn on_interrupt(&self) {
        let status = self.read_reg(REG_INTERRUPT_STATUS);
        if status & INT_USED_RING == 0 {
            if status != 0 {
                self.write_reg(REG_INTERRUPT_ACK, status);
            }
            return;
        }
        self.write_reg(REG_INTERRUPT_ACK, status);
        let mut queues = self.queues.lock();
        for vq in queues.iter_mut().flatten() {
            vq.process_used();
        }
    }
}
