//! FAT12/16/32 filesystem engine (FAT12 volumes are rejected; FAT16 and
//! FAT32 are mounted).

pub mod dir;
pub mod table;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::{Mutex, Once};

use crate::blockdev::{self, BlockDevice};
use crate::buffer::TransactionalBuffer;
use crate::error::{SysError, SysResult};

use super::{Entry, EntryRef, EntryTimestamps, Filesystem};
use dir::{
    build_lfn_records, generate_short_name, BasicFatEntry, FatEntryLocation, RawFatEntry,
    ATTR_DIRECTORY,
};
use table::{FileAllocationTable, Transfer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

/// Where the root directory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootDirectory {
    /// FAT32: an ordinary cluster chain.
    Cluster(u32),
    /// FAT16: a fixed sector area holding a fixed entry count.
    FixedArea { start_sector: u16, entry_count: u16 },
}

#[derive(Debug, Clone, Copy)]
pub struct FatInfo {
    pub fat_type: FatType,
    pub sector_size: u16,
    pub sectors_per_cluster: u32,
    pub fat_begin_sector: u32,
    pub fat_sectors: u32,
    pub root_directory: RootDirectory,
    /// Sector where cluster 2 begins.
    pub data_begin_sector: u32,
}

fn read_le_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn read_le_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

/// Decode a boot sector; `None` when this is not a mountable FAT volume.
pub fn parse_boot_sector(sector0: &[u8]) -> Option<FatInfo> {
    if sector0.len() < 512 || read_le_u16(sector0, 0x1FE) != 0xAA55 {
        return None;
    }

    let sector_size = read_le_u16(sector0, 11);
    if !sector_size.is_power_of_two() || !(512..=4096).contains(&sector_size) {
        return None;
    }
    let sectors_per_cluster = sector0[13] as u32;
    if sectors_per_cluster == 0 {
        return None;
    }
    let reserved_sectors = read_le_u16(sector0, 14) as u32;
    let fat_count = sector0[0x10] as u32;
    let root_entries_16 = read_le_u16(sector0, 17);
    let total_sectors_16 = read_le_u16(sector0, 19) as u32;
    let sectors_per_fat_16 = read_le_u16(sector0, 22) as u32;
    let total_sectors_32 = read_le_u32(sector0, 32);
    let sectors_per_fat_32 = read_le_u32(sector0, 36);
    let root_cluster_32 = read_le_u32(sector0, 44);

    let total_sectors = if total_sectors_16 == 0 {
        total_sectors_32
    } else {
        total_sectors_16
    };
    let sectors_per_fat = if sectors_per_fat_16 == 0 {
        sectors_per_fat_32
    } else {
        sectors_per_fat_16
    };
    if total_sectors == 0 || sectors_per_fat == 0 || fat_count == 0 {
        return None;
    }

    // Root directory area only exists on FAT16.
    let root_dir_sectors =
        (root_entries_16 as u32 * 32).div_ceil(sector_size as u32);
    let data_begin_sector = reserved_sectors + fat_count * sectors_per_fat + root_dir_sectors;

    let total_clusters = total_sectors / sectors_per_cluster;
    let fat_type = if total_clusters < 4085 {
        // FAT12.
        return None;
    } else if total_clusters < 65525 {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    let root_directory = match fat_type {
        FatType::Fat32 => RootDirectory::Cluster(root_cluster_32),
        FatType::Fat16 => RootDirectory::FixedArea {
            start_sector: (reserved_sectors + fat_count * sectors_per_fat) as u16,
            entry_count: root_entries_16,
        },
    };

    Some(FatInfo {
        fat_type,
        sector_size,
        sectors_per_cluster,
        fat_begin_sector: reserved_sectors,
        fat_sectors: sectors_per_fat,
        root_directory,
        data_begin_sector,
    })
}

pub struct FatFilesystem {
    fat: FileAllocationTable,
    root: Once<Arc<FatEntry>>,
}

impl FatFilesystem {
    /// Mount `device` as a FAT volume.
    ///
    /// `NoSuchDevice` when the device cannot be read (unready),
    /// `InvalidArgument` when it does not hold a FAT16/32 volume.
    pub fn try_create_from(device: Arc<dyn BlockDevice>) -> SysResult<Arc<FatFilesystem>> {
        let sector0 = blockdev::blocking_read(&*device, 0, 512)
            .map_err(|_| SysError::NoSuchDevice)?;
        let info = parse_boot_sector(&sector0).ok_or(SysError::InvalidArgument)?;
        log::debug!(
            "fat: {:?} volume, {} B sectors, {} sectors/cluster",
            info.fat_type,
            info.sector_size,
            info.sectors_per_cluster
        );

        let filesystem = Arc::new(FatFilesystem {
            fat: FileAllocationTable::new(info, device),
            root: Once::new(),
        });
        let root_cluster = match info.root_directory {
            RootDirectory::Cluster(cluster) => cluster,
            RootDirectory::FixedArea { .. } => 0,
        };
        let for_root = filesystem.clone();
        filesystem.root.call_once(move || {
            Arc::new(FatEntry {
                filesystem: for_root,
                parent: None,
                is_directory: true,
                state: Mutex::new(EntryState {
                    name: String::new(),
                    size: 0,
                    timestamps: EntryTimestamps::default(),
                    dirty: false,
                    start_cluster: root_cluster,
                    location: FatEntryLocation {
                        directory_start_cluster: 0,
                        index_in_directory: 0,
                    },
                }),
            })
        });
        Ok(filesystem)
    }

    pub fn fat(&self) -> &FileAllocationTable {
        &self.fat
    }

    /// Flush both caches to the device.
    pub fn sync(&self) -> SysResult<()> {
        self.fat.sync()
    }
}

impl Filesystem for FatFilesystem {
    fn get_root(&self) -> EntryRef {
        self.root.get().expect("root built at mount").clone() as EntryRef
    }
}

struct EntryState {
    name: String,
    size: usize,
    timestamps: EntryTimestamps,
    dirty: bool,
    /// First cluster of the content chain; 0 before any allocation.
    start_cluster: u32,
    location: FatEntryLocation,
}

pub struct FatEntry {
    filesystem: Arc<FatFilesystem>,
    parent: Option<Arc<FatEntry>>,
    is_directory: bool,
    state: Mutex<EntryState>,
}

impl fmt::Debug for FatEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatEntry")
            .field("is_directory", &self.is_directory)
            .finish()
    }
}

impl FatEntry {
    fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn make_ref(
        filesystem: &Arc<FatFilesystem>,
        parent: Arc<FatEntry>,
        basic: BasicFatEntry,
        location: FatEntryLocation,
    ) -> Arc<FatEntry> {
        Arc::new(FatEntry {
            filesystem: filesystem.clone(),
            parent: Some(parent),
            is_directory: basic.is_directory(),
            state: Mutex::new(EntryState {
                name: basic.name,
                size: basic.size as usize,
                timestamps: EntryTimestamps {
                    created: Some(basic.creation_timestamp),
                    modified: Some(basic.modified_timestamp),
                    accessed: Some(basic.accessed_timestamp),
                },
                dirty: false,
                start_cluster: basic.data_cluster,
                location,
            }),
        })
    }

    fn children_raw(&self) -> SysResult<Vec<(BasicFatEntry, FatEntryLocation)>> {
        let fat = &self.filesystem.fat;
        if self.is_root() {
            fat.root_entries()
        } else {
            fat.entries_of(self.state.lock().start_cluster)
        }
    }

    /// Directory cluster children live in; fails for the FAT16 fixed
    /// root, which cannot take new entries through the chain path.
    fn directory_cluster(&self) -> SysResult<u32> {
        let cluster = self.state.lock().start_cluster;
        if cluster == 0 {
            Err(SysError::NotSupported)
        } else {
            Ok(cluster)
        }
    }

    fn ensure_allocated(&self) -> SysResult<u32> {
        let mut state = self.state.lock();
        if state.start_cluster == 0 {
            state.start_cluster = self.filesystem.fat.allocate_chain_start()?;
            state.dirty = true;
        }
        Ok(state.start_cluster)
    }
}

impl Entry for FatEntry {
    fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    fn is_directory(&self) -> bool {
        self.is_directory
    }

    fn size(&self) -> usize {
        self.state.lock().size
    }

    fn timestamps(&self) -> EntryTimestamps {
        self.state.lock().timestamps
    }

    fn set_timestamps(&self, timestamps: EntryTimestamps) {
        let mut state = self.state.lock();
        if timestamps.created.is_some() && timestamps.created != state.timestamps.created {
            state.timestamps.created = timestamps.created;
            state.dirty = true;
        }
        if timestamps.modified.is_some() && timestamps.modified != state.timestamps.modified {
            state.timestamps.modified = timestamps.modified;
            state.dirty = true;
        }
        if timestamps.accessed.is_some() && timestamps.accessed != state.timestamps.accessed {
            state.timestamps.accessed = timestamps.accessed;
            state.dirty = true;
        }
    }

    fn parent(&self) -> Option<EntryRef> {
        self.parent.clone().map(|p| p as EntryRef)
    }

    fn flush(&self) -> SysResult<()> {
        if self.is_root() {
            return Ok(());
        }
        let (location, size, start_cluster, timestamps, dirty) = {
            let state = self.state.lock();
            (
                state.location,
                state.size,
                state.start_cluster,
                state.timestamps,
                state.dirty,
            )
        };
        if !dirty {
            return Ok(());
        }
        if self.filesystem.fat.is_read_only() {
            // Dirty metadata on a read-only volume: only timestamp
            // touches can get here, and they cannot be persisted.
            return Err(SysError::NotPermitted);
        }
        if location.directory_start_cluster == 0 {
            // Entry sits in the FAT16 fixed root area.
            log::warn!("fat: metadata flush into the fixed root area is not supported");
            return Ok(());
        }
        let mut basic = self.filesystem.fat.get_entry(location)?;
        basic.size = size as u32;
        basic.data_cluster = start_cluster;
        if let Some(created) = timestamps.created {
            basic.creation_timestamp = created;
        }
        if let Some(modified) = timestamps.modified {
            basic.modified_timestamp = modified;
        }
        if let Some(accessed) = timestamps.accessed {
            basic.accessed_timestamp = accessed;
        }
        self.filesystem.fat.update_entry(location, &basic)?;
        self.state.lock().dirty = false;
        Ok(())
    }

    fn lookup(self: Arc<Self>, name: &str) -> SysResult<EntryRef> {
        if !self.is_directory {
            return Err(SysError::NotADirectory);
        }
        for (basic, location) in self.children_raw()? {
            if basic.name == name {
                let filesystem = self.filesystem.clone();
                return Ok(FatEntry::make_ref(&filesystem, self, basic, location) as EntryRef);
            }
        }
        Err(SysError::NoEntry)
    }

    fn all_children(self: Arc<Self>) -> SysResult<Vec<EntryRef>> {
        if !self.is_directory {
            return Err(SysError::NotADirectory);
        }
        Ok(self
            .children_raw()?
            .into_iter()
            .map(|(basic, location)| {
                FatEntry::make_ref(&self.filesystem, self.clone(), basic, location) as EntryRef
            })
            .collect())
    }

    fn add_child(self: Arc<Self>, name: &str, is_directory: bool) -> SysResult<EntryRef> {
        if !self.is_directory {
            return Err(SysError::NotADirectory);
        }
        if self.filesystem.fat.is_read_only() {
            return Err(SysError::NotPermitted);
        }
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(SysError::InvalidArgument);
        }
        if self
            .children_raw()?
            .iter()
            .any(|(basic, _)| basic.name == name)
        {
            return Err(SysError::Exists);
        }
        let fat = &self.filesystem.fat;
        let dir_cluster = self.directory_cluster()?;

        let existing = fat.short_names_of(dir_cluster)?;
        let short = generate_short_name(name, &existing);

        // Directories start with an allocated, dot-initialised cluster;
        // files allocate lazily on first write.
        let data_cluster = if is_directory {
            let cluster = fat.allocate_chain_start()?;
            let parent_cluster = if self.is_root() { 0 } else { dir_cluster };
            write_dot_entries(fat, cluster, parent_cluster)?;
            cluster
        } else {
            0
        };

        let basic = BasicFatEntry {
            name: String::from(name),
            creation_timestamp: 0,
            accessed_timestamp: 0,
            modified_timestamp: 0,
            size: 0,
            data_cluster,
            raw_attributes: if is_directory { ATTR_DIRECTORY } else { 0 },
        };
        let mut records = build_lfn_records(name, short.checksum());
        records.push(RawFatEntry::from_basic(short, &basic));
        let location = fat.insert_records(dir_cluster, &records)?;

        let filesystem = self.filesystem.clone();
        Ok(FatEntry::make_ref(&filesystem, self, basic, location) as EntryRef)
    }

    fn remove_child(&self, name: &str) -> SysResult<()> {
        if !self.is_directory {
            return Err(SysError::NotADirectory);
        }
        if self.filesystem.fat.is_read_only() {
            return Err(SysError::NotPermitted);
        }
        let (basic, location) = self
            .children_raw()?
            .into_iter()
            .find(|(basic, _)| basic.name == name)
            .ok_or(SysError::NoEntry)?;
        if location.directory_start_cluster == 0 {
            return Err(SysError::NotSupported);
        }
        if basic.is_directory() {
            // Only dot entries may remain.
            let live = self
                .filesystem
                .fat
                .entries_of(basic.data_cluster)?
                .into_iter()
                .filter(|(child, _)| child.name != "." && child.name != "..")
                .count();
            if live != 0 {
                return Err(SysError::InvalidArgument);
            }
        }
        self.filesystem.fat.delete_entry(location)?;
        if basic.data_cluster != 0 {
            self.filesystem.fat.free_chain(basic.data_cluster)?;
        }
        Ok(())
    }

    fn read_bytes(
        &self,
        buffer: &mut dyn TransactionalBuffer,
        offset: usize,
        length: usize,
    ) -> SysResult<usize> {
        if self.is_directory {
            return Err(SysError::NotSupported);
        }
        let (size, start_cluster) = {
            let state = self.state.lock();
            (state.size, state.start_cluster)
        };
        let length = length.min(size.saturating_sub(offset));
        if length == 0 {
            return Ok(0);
        }
        if start_cluster == 0 {
            return Ok(0);
        }
        self.filesystem
            .fat
            .data_interchange(Transfer::Read(buffer), start_cluster, offset, length)?;
        Ok(length)
    }

    fn write_bytes(
        &self,
        buffer: &dyn TransactionalBuffer,
        offset: usize,
        length: usize,
    ) -> SysResult<usize> {
        if self.is_directory {
            return Err(SysError::NotSupported);
        }
        if self.filesystem.fat.is_read_only() {
            return Err(SysError::NotPermitted);
        }
        if length == 0 {
            return Ok(0);
        }
        if offset + length > self.size() {
            self.resize(offset + length)?;
        }
        let start_cluster = self.ensure_allocated()?;
        self.filesystem
            .fat
            .data_interchange(Transfer::Write(buffer), start_cluster, offset, length)?;
        self.state.lock().dirty = true;
        Ok(length)
    }

    fn resize(&self, new_size: usize) -> SysResult<usize> {
        if self.is_directory {
            return Err(SysError::NotSupported);
        }
        if self.filesystem.fat.is_read_only() {
            return Err(SysError::NotPermitted);
        }
        if new_size > self.size() {
            let start_cluster = self.ensure_allocated()?;
            self.filesystem.fat.extend_file(start_cluster, new_size)?;
        }
        // Shrinking keeps the chain; only the recorded size drops.
        let mut state = self.state.lock();
        state.size = new_size;
        state.dirty = true;
        Ok(new_size)
    }
}

/// Initialise a fresh directory cluster with its `.` and `..` entries.
fn write_dot_entries(
    fat: &FileAllocationTable,
    cluster: u32,
    parent_cluster: u32,
) -> SysResult<()> {
    let dot = BasicFatEntry {
        name: String::from("."),
        creation_timestamp: 0,
        accessed_timestamp: 0,
        modified_timestamp: 0,
        size: 0,
        data_cluster: cluster,
        raw_attributes: ATTR_DIRECTORY,
    };
    let dotdot = BasicFatEntry {
        name: String::from(".."),
        creation_timestamp: 0,
        accessed_timestamp: 0,
        modified_timestamp: 0,
        size: 0,
        data_cluster: parent_cluster,
        raw_attributes: ATTR_DIRECTORY,
    };
    let records = [
        RawFatEntry::from_basic(generate_short_name(".", &[]), &dot),
        RawFatEntry::from_basic(generate_short_name("..", &[]), &dotdot),
    ];
    // A fresh cluster: dots at the top, terminator after.
    let mut zero = alloc::vec![0u8; fat.cluster_size()];
    for (i, record) in records.iter().enumerate() {
        zero[i * 32..(i + 1) * 32].copy_from_slice(&record.0);
    }
    let buffer = crate::buffer::KernelBuffer::new(&mut zero);
    let size = buffer.size();
    fat.data_interchange(Transfer::Write(&buffer), cluster, 0, size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamBlockDevice;
    use crate::buffer::KernelBuffer;

    const SECTOR: usize = 512;
    const RESERVED: u32 = 32;
    const FAT_SECTORS: u32 = 560;
    const TOTAL_SECTORS: u32 = 70_000;
    const DATA_BEGIN: u32 = RESERVED + FAT_SECTORS; // One FAT, no FAT16 root area.

    fn put16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn set_fat32(image: &mut [u8], cluster: u32, value: u32) {
        put32(image, RESERVED as usize * SECTOR + cluster as usize * 4, value);
    }

    fn cluster_offset(cluster: u32) -> usize {
        (DATA_BEGIN + (cluster - 2)) as usize * SECTOR
    }

    /// A FAT32 volume: `/HELLO.TXT` ("Hello, world!\n"), plus a
    /// long-named 42-byte file and one deliberately corrupt LFN run.
    fn fat32_image() -> Vec<u8> {
        let mut image = alloc::vec![0u8; TOTAL_SECTORS as usize * SECTOR];
        // Boot sector.
        put16(&mut image, 11, SECTOR as u16);
        image[13] = 1; // sectors per cluster
        put16(&mut image, 14, RESERVED as u16);
        image[0x10] = 1; // FAT count
        put16(&mut image, 17, 0); // no FAT16 root entries
        put16(&mut image, 19, 0);
        put16(&mut image, 22, 0);
        put32(&mut image, 32, TOTAL_SECTORS);
        put32(&mut image, 36, FAT_SECTORS);
        put32(&mut image, 44, 2); // root cluster
        put16(&mut image, 0x1FE, 0xAA55);

        // FAT: media/EOC markers, root chain, two file chains.
        set_fat32(&mut image, 0, 0x0FFF_FFF8);
        set_fat32(&mut image, 1, 0x0FFF_FFFF);
        set_fat32(&mut image, 2, 0x0FFF_FFFF); // root directory
        set_fat32(&mut image, 3, 0x0FFF_FFFF); // HELLO.TXT
        set_fat32(&mut image, 4, 0x0FFF_FFFF); // long-named file

        // Root directory records.
        let root = cluster_offset(2);
        let mut slot = 0usize;
        let mut push = |image: &mut [u8], record: &RawFatEntry| {
            let at = root + slot * 32;
            image[at..at + 32].copy_from_slice(&record.0);
            slot += 1;
        };

        let hello = BasicFatEntry {
            name: String::new(),
            creation_timestamp: 0,
            accessed_timestamp: 0,
            modified_timestamp: 0,
            size: 14,
            data_cluster: 3,
            raw_attributes: 0,
        };
        push(
            &mut image,
            &RawFatEntry::from_basic(generate_short_name("HELLO.TXT", &[]), &hello),
        );

        // Long-named entry with a correct checksum chain.
        let long_name = "GoodbyeCruel WorTXT";
        let short = generate_short_name(long_name, &[]);
        for record in build_lfn_records(long_name, short.checksum()) {
            push(&mut image, &record);
        }
        let goodbye = BasicFatEntry {
            name: String::new(),
            creation_timestamp: 0,
            accessed_timestamp: 0,
            modified_timestamp: 0,
            size: 42,
            data_cluster: 4,
            raw_attributes: 0,
        };
        push(&mut image, &RawFatEntry::from_basic(short, &goodbye));

        // A corrupted LFN run (bad checksum) before a normal record: the
        // enumerator must drop it and keep going.
        let bad_short = generate_short_name("BROKEN.BIN", &[]);
        for record in build_lfn_records("broken-lfn-name.bin", bad_short.checksum().wrapping_add(1))
        {
            push(&mut image, &record);
        }
        let broken = BasicFatEntry {
            name: String::new(),
            creation_timestamp: 0,
            accessed_timestamp: 0,
            modified_timestamp: 0,
            size: 1,
            data_cluster: 0,
            raw_attributes: 0,
        };
        push(&mut image, &RawFatEntry::from_basic(bad_short, &broken));

        // File contents.
        let hello_at = cluster_offset(3);
        image[hello_at..hello_at + 14].copy_from_slice(b"Hello, world!\n");
        image
    }

    fn mount(image: Vec<u8>) -> (Arc<RamBlockDevice>, Arc<FatFilesystem>) {
        let device = Arc::new(RamBlockDevice::from_image(SECTOR, image));
        let filesystem = FatFilesystem::try_create_from(device.clone()).unwrap();
        (device, filesystem)
    }

    #[test]
    fn boot_sector_parse() {
        let image = fat32_image();
        let info = parse_boot_sector(&image[..512]).unwrap();
        assert_eq!(info.fat_type, FatType::Fat32);
        assert_eq!(info.sector_size, 512);
        assert_eq!(info.fat_begin_sector, RESERVED);
        assert_eq!(info.data_begin_sector, DATA_BEGIN);
        assert_eq!(info.root_directory, RootDirectory::Cluster(2));

        // Bad signature is not a FAT volume.
        let mut bad = image;
        bad[0x1FE] = 0;
        assert!(parse_boot_sector(&bad[..512]).is_none());
    }

    #[test]
    fn hello_file_read_round_trip() {
        let (_, filesystem) = mount(fat32_image());
        let root = filesystem.get_root();
        let file = root.lookup("HELLO.TXT").unwrap();
        assert!(!file.is_directory());
        assert_eq!(file.size(), 14);

        let mut raw = [0u8; 32];
        let mut buffer = KernelBuffer::new(&mut raw);
        let read = file.read_bytes(&mut buffer, 0, 32).unwrap();
        assert_eq!(read, 14);
        assert_eq!(&raw[..14], b"Hello, world!\n");

        // Reading past the end returns zero bytes.
        let mut raw = [0u8; 32];
        let mut buffer = KernelBuffer::new(&mut raw);
        assert_eq!(file.read_bytes(&mut buffer, 14, 32).unwrap(), 0);
    }

    #[test]
    fn lfn_enumeration_and_error_recovery() {
        let (_, filesystem) = mount(fat32_image());
        let root = filesystem.get_root();
        let names: Vec<String> = root
            .clone()
            .all_children()
            .unwrap()
            .iter()
            .map(|e| e.name())
            .collect();
        // The corrupt LFN run decays to nothing (its record is dropped);
        // the good long name survives reassembly.
        assert_eq!(names, ["HELLO.TXT", "GoodbyeCruel WorTXT"]);

        let long = root.lookup("GoodbyeCruel WorTXT").unwrap();
        assert_eq!(long.size(), 42);
    }

    #[test]
    fn create_write_read_and_persist() {
        let (device, filesystem) = mount(fat32_image());
        let root = filesystem.get_root();

        let file = root.clone().add_child("journal entry.log", false).unwrap();
        assert_eq!(file.size(), 0);

        // Spans two clusters to exercise chain extension.
        let mut content = alloc::vec![0u8; 700];
        for (i, byte) in content.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let buffer_data = content.clone();
        let mut source = buffer_data;
        let source_buffer = KernelBuffer::new(&mut source);
        assert_eq!(file.write_bytes(&source_buffer, 0, 700).unwrap(), 700);
        assert_eq!(file.size(), 700);

        let mut readback = alloc::vec![0u8; 700];
        let mut dest = KernelBuffer::new(&mut readback);
        assert_eq!(file.read_bytes(&mut dest, 0, 700).unwrap(), 700);
        assert_eq!(readback, content);

        // Push metadata and caches to the device, then remount fresh.
        file.flush().unwrap();
        filesystem.sync().unwrap();

        let remounted = FatFilesystem::try_create_from(device).unwrap();
        let again = remounted.get_root().lookup("journal entry.log").unwrap();
        assert_eq!(again.size(), 700);
        let mut readback = alloc::vec![0u8; 700];
        let mut dest = KernelBuffer::new(&mut readback);
        assert_eq!(again.read_bytes(&mut dest, 0, 700).unwrap(), 700);
        assert_eq!(readback, content);
    }

    #[test]
    fn directories_create_and_remove() {
        let (_, filesystem) = mount(fat32_image());
        let root = filesystem.get_root();

        let subdir = root.clone().add_child("Documents", true).unwrap();
        assert!(subdir.is_directory());
        // Dot entries come with the directory.
        let names: Vec<String> = subdir
            .clone()
            .all_children()
            .unwrap()
            .iter()
            .map(|e| e.name())
            .collect();
        assert_eq!(names, [".", ".."]);

        let inner = subdir.clone().add_child("inner.txt", false).unwrap();
        let mut content = *b"abc";
        let buffer = KernelBuffer::new(&mut content);
        inner.write_bytes(&buffer, 0, 3).unwrap();

        // A populated directory refuses removal; empty it first.
        assert_eq!(
            root.clone().remove_child("Documents"),
            Err(SysError::InvalidArgument)
        );
        subdir.remove_child("inner.txt").unwrap();
        root.clone().remove_child("Documents").unwrap();
        assert_eq!(
            root.lookup("Documents").unwrap_err(),
            SysError::NoEntry
        );
    }

    #[test]
    fn read_only_volume_rejects_writes_up_front() {
        let mut device = RamBlockDevice::from_image(SECTOR, fat32_image());
        device.set_read_only(true);
        let filesystem = FatFilesystem::try_create_from(Arc::new(device)).unwrap();
        let root = filesystem.get_root();

        // Reads still work.
        let file = root.clone().lookup("HELLO.TXT").unwrap();
        let mut raw = [0u8; 32];
        let mut buffer = KernelBuffer::new(&mut raw);
        assert_eq!(file.read_bytes(&mut buffer, 0, 32).unwrap(), 14);

        // Every mutating operation fails with EPERM before touching the
        // caches, and the entry stays clean.
        let mut data = *b"xx";
        let buffer = KernelBuffer::new(&mut data);
        assert_eq!(
            file.write_bytes(&buffer, 0, 2),
            Err(SysError::NotPermitted)
        );
        assert_eq!(file.resize(100), Err(SysError::NotPermitted));
        assert_eq!(file.size(), 14);
        assert_eq!(
            root.clone().add_child("new.txt", false).unwrap_err(),
            SysError::NotPermitted
        );
        assert_eq!(
            root.remove_child("HELLO.TXT"),
            Err(SysError::NotPermitted)
        );
        // Nothing became dirty, so flush is a no-op.
        file.flush().unwrap();
    }

    #[test]
    fn duplicate_names_rejected() {
        let (_, filesystem) = mount(fat32_image());
        let root = filesystem.get_root();
        assert_eq!(
            root.clone().add_child("HELLO.TXT", false).unwrap_err(),
            SysError::Exists
        );
    }

    #[test]
    fn fat16_fixed_root_enumerates() {
        // A small FAT16 volume: 8000 sectors of 512 B, one file in the
        // fixed root area.
        let total: u32 = 8000;
        let reserved: u32 = 4;
        let fat_sectors: u32 = 32; // 8192 u16 entries
        let root_entries: u16 = 512;
        let root_sectors: u32 = 32;
        let mut image = alloc::vec![0u8; total as usize * SECTOR];
        put16(&mut image, 11, SECTOR as u16);
        image[13] = 1;
        put16(&mut image, 14, reserved as u16);
        image[0x10] = 1;
        put16(&mut image, 17, root_entries);
        put16(&mut image, 19, 0);
        put16(&mut image, 22, fat_sectors as u16);
        put32(&mut image, 32, total);
        put16(&mut image, 0x1FE, 0xAA55);

        // FAT16 entries: cluster 2 holds the file, EOC.
        let fat_base = reserved as usize * SECTOR;
        put16(&mut image, fat_base, 0xFFF8);
        put16(&mut image, fat_base + 2, 0xFFFF);
        put16(&mut image, fat_base + 4, 0xFFFF);

        // Root area record.
        let root_base = (reserved + fat_sectors) as usize * SECTOR;
        let readme = BasicFatEntry {
            name: String::new(),
            creation_timestamp: 0,
            accessed_timestamp: 0,
            modified_timestamp: 0,
            size: 5,
            data_cluster: 2,
            raw_attributes: 0,
        };
        let record = RawFatEntry::from_basic(generate_short_name("README.MD", &[]), &readme);
        image[root_base..root_base + 32].copy_from_slice(&record.0);

        // Data cluster 2.
        let data_base = (reserved + fat_sectors + root_sectors) as usize * SECTOR;
        image[data_base..data_base + 5].copy_from_slice(b"fat16");

        let (_, filesystem) = mount(image);
        assert_eq!(filesystem.fat().info().fat_type, FatType::Fat16);
        let root = filesystem.get_root();
        let file = root.lookup("README.MD").unwrap();
        assert_eq!(file.size(), 5);
        let mut raw = [0u8; 8];
        let mut buffer = KernelBuffer::new(&mut raw);
        assert_eq!(file.read_bytes(&mut buffer, 0, 8).unwrap(), 5);
        assert_eq!(&raw[..5], b"fat16");
    }
}

