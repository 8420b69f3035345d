//! Block device abstraction and registry.
//!
//! Devices expose an asynchronous interface: `schedule_read`/`schedule_write`
//! take ownership of the transfer buffer and invoke the completion exactly
//! once with a [`TransferResult`] and the buffer. The registry names raw
//! devices by prefix with monotonically increasing suffixes; registering a
//! raw device kicks off an MBR probe whose partitions appear as sibling
//! proxy devices — those are what the filesystem layer mounts.

pub mod cache;
pub mod mbr;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{SysError, SysResult};
use crate::sync::CompletionFlag;

pub use mbr::PartitionProxyDevice;

/// Sector size assumed for MBR parsing and partition arithmetic.
pub const SECTOR_SIZE: usize = 512;

/// Outcome of a scheduled transfer, reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    Success,
    BadAlignment,
    OutOfBounds,
    /// Write rejected by a read-only device; surfaces as `EPERM`.
    ReadOnly,
    Failure,
}

/// Completion for a scheduled transfer; receives the result and the
/// buffer back.
pub type TransferCompletion = Box<dyn FnOnce(TransferResult, Vec<u8>) + Send>;

pub trait BlockDevice: Send + Sync {
    fn logical_block_size(&self) -> usize;

    /// Device capacity in bytes.
    fn capacity(&self) -> u64;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Read `buffer.len()` bytes starting at `byte_offset`. Offset and
    /// length must be multiples of the logical block size.
    fn schedule_read(&self, byte_offset: u64, buffer: Vec<u8>, completion: TransferCompletion);

    /// Write `buffer` at `byte_offset`, same alignment rules.
    fn schedule_write(&self, byte_offset: u64, buffer: Vec<u8>, completion: TransferCompletion);
}

/// Shared alignment/bounds validation for implementations. Returns the
/// result to report immediately, or None when the transfer may proceed.
pub fn validate_transfer(
    device: &dyn BlockDevice,
    byte_offset: u64,
    len: usize,
) -> Option<TransferResult> {
    let block = device.logical_block_size() as u64;
    if byte_offset % block != 0 || len as u64 % block != 0 {
        return Some(TransferResult::BadAlignment);
    }
    if byte_offset + len as u64 > device.capacity() {
        return Some(TransferResult::OutOfBounds);
    }
    None
}

/// Synchronous bridge over the asynchronous read API.
pub fn blocking_read(device: &dyn BlockDevice, byte_offset: u64, len: usize) -> SysResult<Vec<u8>> {
    let done = Arc::new(CompletionFlag::new());
    let slot: Arc<Mutex<Option<(TransferResult, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    {
        let done = done.clone();
        let slot = slot.clone();
        device.schedule_read(
            byte_offset,
            alloc::vec![0u8; len],
            Box::new(move |result, buffer| {
                *slot.lock() = Some((result, buffer));
                done.set();
            }),
        );
    }
    done.wait();
    let (result, buffer) = slot.lock().take().expect("completion ran");
    match result {
        TransferResult::Success => Ok(buffer),
        TransferResult::OutOfBounds | TransferResult::BadAlignment => Err(SysError::InvalidArgument),
        TransferResult::ReadOnly => Err(SysError::NotPermitted),
        TransferResult::Failure => Err(SysError::IoError),
    }
}

/// Synchronous bridge over the asynchronous write API.
pub fn blocking_write(device: &dyn BlockDevice, byte_offset: u64, buffer: Vec<u8>) -> SysResult<()> {
    let done = Arc::new(CompletionFlag::new());
    let slot: Arc<Mutex<Option<TransferResult>>> = Arc::new(Mutex::new(None));
    {
        let done = done.clone();
        let slot = slot.clone();
        device.schedule_write(
            byte_offset,
            buffer,
            Box::new(move |result, _| {
                *slot.lock() = Some(result);
                done.set();
            }),
        );
    }
    done.wait();
    let result = slot.lock().take().expect("completion ran");
    match result {
        TransferResult::Success => Ok(()),
        TransferResult::OutOfBounds | TransferResult::BadAlignment => Err(SysError::InvalidArgument),
        TransferResult::ReadOnly => Err(SysError::NotPermitted),
        TransferResult::Failure => Err(SysError::IoError),
    }
}

/// Process-wide block device registry.
pub struct BlockDeviceRegistry {
    raw_devices: BTreeMap<String, Arc<dyn BlockDevice>>,
    partitions: BTreeMap<String, Arc<dyn BlockDevice>>,
    prefix_counters: BTreeMap<String, u32>,
}

static BLOCK_REGISTRY: Mutex<BlockDeviceRegistry> = Mutex::new(BlockDeviceRegistry::new());

impl BlockDeviceRegistry {
    pub const fn new() -> Self {
        Self {
            raw_devices: BTreeMap::new(),
            partitions: BTreeMap::new(),
            prefix_counters: BTreeMap::new(),
        }
    }

    fn allocate_name(&mut self, prefix: &str) -> String {
        let counter = self.prefix_counters.entry(String::from(prefix)).or_insert(0);
        let name = format!("{}{}", prefix, *counter);
        *counter += 1;
        name
    }

    /// Devices the filesystem layer may mount: the partition proxies.
    pub fn accessible_devices(&self) -> Vec<(String, Arc<dyn BlockDevice>)> {
        self.partitions
            .iter()
            .map(|(name, dev)| (name.clone(), dev.clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.raw_devices
            .get(name)
            .or_else(|| self.partitions.get(name))
            .cloned()
    }
}

impl Default for BlockDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn with_registry<R>(f: impl FnOnce(&mut BlockDeviceRegistry) -> R) -> R {
    // Partition probes complete from interrupt context; mask while held.
    let _irq = crate::arch::interrupt_guard();
    f(&mut BLOCK_REGISTRY.lock())
}

/// Register a raw device and kick off its partition probe.
///
/// The probe reads sector 0 asynchronously; when it completes, each
/// non-empty MBR entry becomes a [`PartitionProxyDevice`] sibling in the
/// registry.
pub fn register_raw_device(prefix: &str, device: Arc<dyn BlockDevice>) -> String {
    let name = {
        let _irq = crate::arch::interrupt_guard();
        let mut registry = BLOCK_REGISTRY.lock();
        let name = registry.allocate_name(prefix);
        registry.raw_devices.insert(name.clone(), device.clone());
        name
    };
    log::info!("blockdev: registered {}", name);

    let base_name = name.clone();
    let probe_device = device.clone();
    device.schedule_read(
        0,
        alloc::vec![0u8; SECTOR_SIZE],
        Box::new(move |result, buffer| {
            if result != TransferResult::Success {
                log::warn!("blockdev: {}: sector-0 read failed, no partitions", base_name);
                return;
            }
            let entries = mbr::parse_mbr(&buffer);
            let _irq = crate::arch::interrupt_guard();
            let mut registry = BLOCK_REGISTRY.lock();
            for (index, entry) in entries.iter().enumerate() {
                let partition: Arc<dyn BlockDevice> = Arc::new(PartitionProxyDevice::new(
                    probe_device.clone(),
                    entry.first_sector,
                    entry.sector_count,
                ));
                let part_name = format!("{}.p{}", base_name, index);
                log::info!(
                    "blockdev: {}: {:?} partition, {} sectors at {}",
                    part_name,
                    entry.kind,
                    entry.sector_count,
                    entry.first_sector
                );
                registry.partitions.insert(part_name, partition);
            }
        }),
    );
    name
}

/// RAM-backed block device for tests and ramdisks.
pub struct RamBlockDevice {
    block_size: usize,
    read_only: bool,
    data: Mutex<Vec<u8>>,
}

impl RamBlockDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            read_only: false,
            data: Mutex::new(alloc::vec![0u8; block_size * block_count as usize]),
        }
    }

    pub fn from_image(block_size: usize, image: Vec<u8>) -> Self {
        assert_eq!(image.len() % block_size, 0);
        Self {
            block_size,
            read_only: false,
            data: Mutex::new(image),
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Snapshot for test assertions.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockDevice for RamBlockDevice {
    fn logical_block_size(&self) -> usize {
        self.block_size
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn schedule_read(&self, byte_offset: u64, mut buffer: Vec<u8>, completion: TransferCompletion) {
        if let Some(fail) = validate_transfer(self, byte_offset, buffer.len()) {
            completion(fail, buffer);
            return;
        }
        let data = self.data.lock();
        let start = byte_offset as usize;
        let len = buffer.len();
        buffer.copy_from_slice(&data[start..start + len]);
        drop(data);
        completion(TransferResult::Success, buffer);
    }

    fn schedule_write(&self, byte_offset: u64, buffer: Vec<u8>, completion: TransferCompletion) {
        if self.read_only {
            completion(TransferResult::ReadOnly, buffer);
            return;
        }
        if let Some(fail) = validate_transfer(self, byte_offset, buffer.len()) {
            completion(fail, buffer);
            return;
        }
        {
            let mut data = self.data.lock();
            let start = byte_offset as usize;
            data[start..start + buffer.len()].copy_from_slice(&buffer);
        }
        completion(TransferResult::Success, buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_device_round_trip() {
        let dev = RamBlockDevice::new(512, 16);
        assert_eq!(dev.capacity(), 8192);

        let mut block = alloc::vec![0u8; 512];
        block[0] = 0xAB;
        block[511] = 0xCD;
        blocking_write(&dev, 1024, block).unwrap();

        let read = blocking_read(&dev, 1024, 512).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[511], 0xCD);
    }

    #[test]
    fn alignment_and_bounds_are_enforced() {
        let dev = RamBlockDevice::new(512, 4);
        assert_eq!(blocking_read(&dev, 3, 512), Err(SysError::InvalidArgument));
        assert_eq!(blocking_read(&dev, 0, 100), Err(SysError::InvalidArgument));
        assert_eq!(
            blocking_read(&dev, 2048, 512),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn read_only_device_rejects_writes() {
        let mut dev = RamBlockDevice::new(512, 4);
        dev.set_read_only(true);
        assert!(dev.is_read_only());
        assert_eq!(
            blocking_write(&dev, 0, alloc::vec![0u8; 512]),
            Err(SysError::NotPermitted)
        );
    }
}
