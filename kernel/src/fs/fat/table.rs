//! The file allocation table engine: cluster chains, cached data
//! clusters and FAT sectors, directory record streams, and allocation.
//!
//! Both caches are bounded LRU with write-back on eviction: a dirty item
//! has its dirty span written synchronously before the slot is released.
//! All cache and allocation state sits behind one lock per volume; the
//! block device is only entered with that lock held, which is safe
//! because device completion paths never re-enter the FAT engine.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::blockdev::cache::BlockCacheItem;
use crate::blockdev::{self, BlockDevice};
use crate::buffer::TransactionalBuffer;
use crate::error::{SysError, SysResult};
use crate::utils::lru::LruCache;

use super::dir::{
    pack_entry, BasicFatEntry, FatEntryLocation, RawEntryType, RawFatEntry, RAW_ENTRY_SIZE,
};
use super::{FatInfo, FatType, RootDirectory};

const CLUSTER_CACHE_MAX: usize = 10;
const FAT_SECTOR_CACHE_MAX: usize = 10;

/// Canonical end-of-chain value written on allocation.
const CLUSTER_EOC: u32 = 0x0FFF_FFFF;
/// Top nibble of a FAT32 entry is reserved metadata.
const METADATA_MASK: u32 = 0xF000_0000;

/// Classification of a FAT entry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    NextPointer,
    EndOfChain,
    Free,
    Corrupt,
    Reserved,
}

/// Classify a (FAT32-normalised) entry value.
pub fn cluster_type(value: u32) -> ClusterType {
    let value = value & !METADATA_MASK;
    if value > 1 && value <= 0x0FFF_FFEF {
        ClusterType::NextPointer
    } else if value == 0 {
        ClusterType::Free
    } else if value >= 0x0FFF_FFF8 {
        ClusterType::EndOfChain
    } else if value == 0x0FFF_FFF7 {
        ClusterType::Corrupt
    } else {
        ClusterType::Reserved
    }
}

/// Transfer direction through the cluster cache.
pub enum Transfer<'a> {
    /// Filesystem to caller.
    Read(&'a mut dyn TransactionalBuffer),
    /// Caller to filesystem.
    Write(&'a dyn TransactionalBuffer),
}

impl Transfer<'_> {
    fn is_write(&self) -> bool {
        matches!(self, Transfer::Write(_))
    }
}

struct Caches {
    clusters: LruCache<u32, BlockCacheItem>,
    fat_sectors: LruCache<u32, BlockCacheItem>,
    free_cluster_hint: u32,
}

pub struct FileAllocationTable {
    info: FatInfo,
    device: Arc<dyn BlockDevice>,
    caches: Mutex<Caches>,
}

impl FileAllocationTable {
    pub fn new(info: FatInfo, device: Arc<dyn BlockDevice>) -> Self {
        Self {
            info,
            device,
            caches: Mutex::new(Caches {
                clusters: LruCache::new(CLUSTER_CACHE_MAX),
                fat_sectors: LruCache::new(FAT_SECTOR_CACHE_MAX),
                free_cluster_hint: 2,
            }),
        }
    }

    pub fn info(&self) -> &FatInfo {
        &self.info
    }

    /// True when the backing device rejects writes; callers fail mutating
    /// operations up front with `NotPermitted` instead of dirtying caches
    /// that could never be written back.
    pub fn is_read_only(&self) -> bool {
        self.device.is_read_only()
    }

    pub fn cluster_size(&self) -> usize {
        self.info.sectors_per_cluster as usize * self.info.sector_size as usize
    }

    fn cluster_byte_addr(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2);
        (self.info.data_begin_sector as u64
            + self.info.sectors_per_cluster as u64 * (cluster as u64 - 2))
            * self.info.sector_size as u64
    }

    fn fat_sector_byte_addr(&self, sector: u32) -> u64 {
        (self.info.fat_begin_sector as u64 + sector as u64) * self.info.sector_size as u64
    }

    fn fat_entry_width(&self) -> usize {
        match self.info.fat_type {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }

    fn fat_entry_count(&self) -> u32 {
        (self.info.fat_sectors as u64 * self.info.sector_size as u64 / self.fat_entry_width() as u64)
            as u32
    }

    fn fat_position(&self, cluster: u32) -> (u32, usize) {
        let byte = cluster as u64 * self.fat_entry_width() as u64;
        (
            (byte / self.info.sector_size as u64) as u32,
            (byte % self.info.sector_size as u64) as usize,
        )
    }

    // ------------------------------------------------------------------
    // Cache plumbing (all under the caches lock)
    // ------------------------------------------------------------------

    fn write_back_cluster(&self, cluster: u32, item: &BlockCacheItem) {
        if let Some((lo, hi)) = item.take_dirty() {
            // The device works in whole sectors; widen the dirty span.
            let sector = self.info.sector_size as usize;
            let aligned_lo = lo - lo % sector;
            let aligned_hi = hi.div_ceil(sector) * sector;
            let mut span = alloc::vec![0u8; aligned_hi - aligned_lo];
            item.read(aligned_lo, &mut span);
            if blockdev::blocking_write(
                &*self.device,
                self.cluster_byte_addr(cluster) + aligned_lo as u64,
                span,
            )
            .is_err()
            {
                log::error!("fat: write-back of cluster {} failed", cluster);
            }
        }
    }

    fn write_back_fat_sector(&self, sector: u32, item: &BlockCacheItem) {
        if item.take_dirty().is_some() {
            if blockdev::blocking_write(
                &*self.device,
                self.fat_sector_byte_addr(sector),
                item.snapshot(),
            )
            .is_err()
            {
                log::error!("fat: write-back of FAT sector {} failed", sector);
            }
        }
    }

    fn fetch_fat_sector(&self, caches: &mut Caches, sector: u32) -> SysResult<Arc<BlockCacheItem>> {
        if sector >= self.info.fat_sectors {
            return Err(SysError::InvalidArgument);
        }
        if let Some(item) = caches.fat_sectors.find(&sector) {
            return Ok(item);
        }
        let bytes = blockdev::blocking_read(
            &*self.device,
            self.fat_sector_byte_addr(sector),
            self.info.sector_size as usize,
        )
        .map_err(|_| SysError::IoError)?;
        let item = Arc::new(BlockCacheItem::from_bytes(bytes));
        // A racer may have populated the slot meanwhile; use theirs.
        let item = if caches.fat_sectors.insert(sector, item.clone()) {
            item
        } else {
            caches.fat_sectors.find(&sector).expect("racer's item")
        };
        caches
            .fat_sectors
            .purge_excess(|victim, data| self.write_back_fat_sector(victim, data));
        Ok(item)
    }

    fn fetch_cluster(
        &self,
        caches: &mut Caches,
        cluster: u32,
        needs_content: bool,
    ) -> SysResult<Arc<BlockCacheItem>> {
        if let Some(item) = caches.clusters.find(&cluster) {
            return Ok(item);
        }
        let item = if needs_content {
            let bytes = blockdev::blocking_read(
                &*self.device,
                self.cluster_byte_addr(cluster),
                self.cluster_size(),
            )
            .map_err(|_| SysError::IoError)?;
            Arc::new(BlockCacheItem::from_bytes(bytes))
        } else {
            // Content will be fully overwritten; skip the device read.
            Arc::new(BlockCacheItem::from_bytes(alloc::vec![
                0u8;
                self.cluster_size()
            ]))
        };
        let item = if caches.clusters.insert(cluster, item.clone()) {
            item
        } else {
            caches.clusters.find(&cluster).expect("racer's item")
        };
        caches
            .clusters
            .purge_excess(|victim, data| self.write_back_cluster(victim, data));
        Ok(item)
    }

    fn fat_value(&self, caches: &mut Caches, cluster: u32) -> SysResult<u32> {
        let (sector, offset) = self.fat_position(cluster);
        let item = self.fetch_fat_sector(caches, sector)?;
        let mut raw = [0u8; 4];
        match self.info.fat_type {
            FatType::Fat16 => {
                item.read(offset, &mut raw[..2]);
                let value = u16::from_le_bytes([raw[0], raw[1]]) as u32;
                // Normalise to the FAT32 value space.
                Ok(if value < 0xFFF7 {
                    value
                } else {
                    value | 0x0FFF_0000
                })
            }
            FatType::Fat32 => {
                item.read(offset, &mut raw);
                Ok(u32::from_le_bytes(raw) & !METADATA_MASK)
            }
        }
    }

    fn set_fat_value(&self, caches: &mut Caches, cluster: u32, value: u32) -> SysResult<()> {
        let (sector, offset) = self.fat_position(cluster);
        let item = self.fetch_fat_sector(caches, sector)?;
        match self.info.fat_type {
            FatType::Fat16 => {
                item.write(offset, &(value as u16).to_le_bytes());
            }
            FatType::Fat32 => {
                let mut raw = [0u8; 4];
                item.read(offset, &mut raw);
                let preserved = u32::from_le_bytes(raw) & METADATA_MASK;
                item.write(offset, &(preserved | (value & !METADATA_MASK)).to_le_bytes());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chain operations
    // ------------------------------------------------------------------

    /// FAT entry for `cluster`, normalised to the FAT32 value space.
    pub fn next_cluster(&self, cluster: u32) -> SysResult<u32> {
        self.fat_value(&mut self.caches.lock(), cluster)
    }

    /// Collect a whole chain; `InvalidArgument` on corrupt or reserved
    /// links.
    pub fn collect_chain(&self, start_cluster: u32) -> SysResult<Vec<u32>> {
        let mut caches = self.caches.lock();
        let mut chain = alloc::vec![start_cluster];
        let mut current = start_cluster;
        loop {
            let next = self.fat_value(&mut caches, current)?;
            match cluster_type(next) {
                ClusterType::NextPointer => {
                    if chain.len() >= self.fat_entry_count() as usize {
                        // Cycle in the chain.
                        return Err(SysError::InvalidArgument);
                    }
                    chain.push(next);
                    current = next;
                }
                ClusterType::EndOfChain => return Ok(chain),
                ClusterType::Free | ClusterType::Corrupt | ClusterType::Reserved => {
                    return Err(SysError::InvalidArgument)
                }
            }
        }
    }

    fn allocate_cluster(&self, caches: &mut Caches, link_from: Option<u32>) -> SysResult<u32> {
        let total = self.fat_entry_count();
        let hint = caches.free_cluster_hint.max(2);

        // Scan from the hint, wrapping once.
        let candidates = (hint..total).chain(2..hint);
        for candidate in candidates {
            let value = self.fat_value(caches, candidate)?;
            if cluster_type(value) != ClusterType::Free {
                continue;
            }
            self.set_fat_value(caches, candidate, CLUSTER_EOC)?;
            caches.free_cluster_hint = if candidate + 1 >= total {
                2
            } else {
                candidate + 1
            };
            if let Some(previous) = link_from {
                self.set_fat_value(caches, previous, candidate)?;
            }
            return Ok(candidate);
        }
        Err(SysError::OutOfMemory)
    }

    /// Allocate a fresh single-cluster chain (new file or directory).
    pub fn allocate_chain_start(&self) -> SysResult<u32> {
        self.allocate_cluster(&mut self.caches.lock(), None)
    }

    /// Append one cluster after `tail_cluster`.
    pub fn allocate_next_cluster(&self, tail_cluster: u32) -> SysResult<u32> {
        self.allocate_cluster(&mut self.caches.lock(), Some(tail_cluster))
    }

    /// Ensure the chain from `start_cluster` covers `size` bytes.
    pub fn extend_file(&self, start_cluster: u32, size: usize) -> SysResult<()> {
        let bytes_per_cluster = self.cluster_size();
        let mut caches = self.caches.lock();
        let mut covered = bytes_per_cluster;
        let mut current = start_cluster;
        while covered < size {
            let next = self.fat_value(&mut caches, current)?;
            current = if cluster_type(next) == ClusterType::NextPointer {
                next
            } else {
                self.allocate_cluster(&mut caches, Some(current))?
            };
            covered += bytes_per_cluster;
        }
        Ok(())
    }

    /// Free a whole chain (entry removal).
    pub fn free_chain(&self, start_cluster: u32) -> SysResult<()> {
        let mut caches = self.caches.lock();
        let mut current = start_cluster;
        loop {
            let next = self.fat_value(&mut caches, current)?;
            self.set_fat_value(&mut caches, current, 0)?;
            if caches.free_cluster_hint > current {
                caches.free_cluster_hint = current;
            }
            match cluster_type(next) {
                ClusterType::NextPointer => current = next,
                _ => return Ok(()),
            }
        }
    }

    // ------------------------------------------------------------------
    // Data interchange
    // ------------------------------------------------------------------

    /// Transfer `size` bytes at `offset` within the chain starting at
    /// `start_cluster`, cluster by cluster through the cache.
    ///
    /// A write that covers a whole cluster skips loading its previous
    /// content. Running off the end of the chain reports `IoError`.
    pub fn data_interchange(
        &self,
        mut transfer: Transfer<'_>,
        start_cluster: u32,
        offset: usize,
        size: usize,
    ) -> SysResult<()> {
        if size == 0 {
            return Ok(());
        }
        let cluster_size = self.cluster_size();
        let mut caches = self.caches.lock();

        // Walk to the cluster containing `offset`.
        let mut current = start_cluster;
        for _ in 0..offset / cluster_size {
            let next = self.fat_value(&mut caches, current)?;
            if cluster_type(next) != ClusterType::NextPointer {
                return Err(SysError::IoError);
            }
            current = next;
        }

        let mut completed = 0usize;
        loop {
            let byte_offset = if completed == 0 {
                offset % cluster_size
            } else {
                0
            };
            let to_copy = (size - completed).min(cluster_size - byte_offset);
            let whole_cluster_write =
                transfer.is_write() && byte_offset == 0 && to_copy == cluster_size;

            let item = self.fetch_cluster(&mut caches, current, !whole_cluster_write)?;
            match &mut transfer {
                Transfer::Read(buffer) => {
                    let mut chunk = alloc::vec![0u8; to_copy];
                    item.read(byte_offset, &mut chunk);
                    buffer.write_from(&chunk, completed)?;
                }
                Transfer::Write(buffer) => {
                    let mut chunk = alloc::vec![0u8; to_copy];
                    buffer.read_to(&mut chunk, completed)?;
                    item.write(byte_offset, &chunk);
                }
            }
            drop(item);

            completed += to_copy;
            if completed == size {
                return Ok(());
            }
            let next = self.fat_value(&mut caches, current)?;
            if cluster_type(next) != ClusterType::NextPointer {
                return Err(SysError::IoError);
            }
            current = next;
        }
    }

    /// Write every dirty cache item back to the device.
    pub fn sync(&self) -> SysResult<()> {
        let mut caches = self.caches.lock();
        caches
            .clusters
            .flush_all(|cluster, item| self.write_back_cluster(cluster, item));
        caches
            .fat_sectors
            .flush_all(|sector, item| self.write_back_fat_sector(sector, item));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory record streams
    // ------------------------------------------------------------------

    fn entries_per_cluster(&self) -> usize {
        self.cluster_size() / RAW_ENTRY_SIZE
    }

    fn read_raw_record(&self, chain: &[u32], index: usize) -> SysResult<RawFatEntry> {
        let per_cluster = self.entries_per_cluster();
        let cluster = *chain.get(index / per_cluster).ok_or(SysError::IoError)?;
        let mut record = RawFatEntry::zeroed();
        let mut caches = self.caches.lock();
        let item = self.fetch_cluster(&mut caches, cluster, true)?;
        item.read((index % per_cluster) * RAW_ENTRY_SIZE, &mut record.0);
        Ok(record)
    }

    fn write_raw_record(&self, chain: &[u32], index: usize, record: &RawFatEntry) -> SysResult<()> {
        let per_cluster = self.entries_per_cluster();
        let cluster = *chain.get(index / per_cluster).ok_or(SysError::IoError)?;
        let mut caches = self.caches.lock();
        let item = self.fetch_cluster(&mut caches, cluster, true)?;
        item.write((index % per_cluster) * RAW_ENTRY_SIZE, &record.0);
        Ok(())
    }

    /// Raw records of a FAT16 fixed root area.
    fn read_fat16_root(&self, start_sector: u16, entry_count: u16) -> SysResult<Vec<RawFatEntry>> {
        let bytes = blockdev::blocking_read(
            &*self.device,
            start_sector as u64 * self.info.sector_size as u64,
            (entry_count as usize * RAW_ENTRY_SIZE).div_ceil(self.info.sector_size as usize)
                * self.info.sector_size as usize,
        )
        .map_err(|_| SysError::IoError)?;
        Ok(bytes
            .chunks_exact(RAW_ENTRY_SIZE)
            .take(entry_count as usize)
            .map(|chunk| {
                let mut record = RawFatEntry::zeroed();
                record.0.copy_from_slice(chunk);
                RawFatEntry(record.0)
            })
            .collect())
    }

    /// Enumerate the entries of a directory chain, reassembling LFN runs.
    /// Malformed runs are logged and skipped.
    pub fn entries_of(&self, start_cluster: u32) -> SysResult<Vec<(BasicFatEntry, FatEntryLocation)>> {
        let chain = self.collect_chain(start_cluster)?;
        let total = chain.len() * self.entries_per_cluster();
        let mut out = Vec::new();
        let mut pending: Vec<RawFatEntry> = Vec::new();
        let mut pending_start = 0u32;

        for index in 0..total {
            let record = self.read_raw_record(&chain, index)?;
            match record.entry_type() {
                RawEntryType::EndOfDirectory => break,
                RawEntryType::Deleted => {
                    pending.clear();
                }
                RawEntryType::LongFileName => {
                    if pending.is_empty() {
                        if record.lfn_order() & 0x40 == 0 {
                            // Mid-sequence record with no start; drop it.
                            continue;
                        }
                        pending_start = index as u32;
                    }
                    pending.push(record);
                }
                RawEntryType::Normal => {
                    if pending.is_empty() {
                        pending_start = index as u32;
                    }
                    pending.push(record);
                    match pack_entry(&pending) {
                        Ok(basic) => out.push((
                            basic,
                            FatEntryLocation {
                                directory_start_cluster: start_cluster,
                                index_in_directory: pending_start,
                            },
                        )),
                        Err(_) => {
                            log::warn!("fat: discarding malformed directory entry");
                        }
                    }
                    pending.clear();
                }
            }
        }
        Ok(out)
    }

    /// Enumerate the root directory.
    pub fn root_entries(&self) -> SysResult<Vec<(BasicFatEntry, FatEntryLocation)>> {
        match self.info.root_directory {
            RootDirectory::Cluster(cluster) => self.entries_of(cluster),
            RootDirectory::FixedArea {
                start_sector,
                entry_count,
            } => {
                let records = self.read_fat16_root(start_sector, entry_count)?;
                let mut out = Vec::new();
                let mut pending: Vec<RawFatEntry> = Vec::new();
                let mut pending_start = 0u32;
                for (index, record) in records.iter().enumerate() {
                    match record.entry_type() {
                        RawEntryType::EndOfDirectory => break,
                        RawEntryType::Deleted => pending.clear(),
                        RawEntryType::LongFileName => {
                            if pending.is_empty() {
                                if record.lfn_order() & 0x40 == 0 {
                                    continue;
                                }
                                pending_start = index as u32;
                            }
                            pending.push(*record);
                        }
                        RawEntryType::Normal => {
                            if pending.is_empty() {
                                pending_start = index as u32;
                            }
                            pending.push(*record);
                            match pack_entry(&pending) {
                                Ok(basic) => out.push((
                                    basic,
                                    FatEntryLocation {
                                        directory_start_cluster: 0,
                                        index_in_directory: pending_start,
                                    },
                                )),
                                Err(_) => {
                                    log::warn!("fat: discarding malformed root entry")
                                }
                            }
                            pending.clear();
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Re-read the entry at `location`.
    pub fn get_entry(&self, location: FatEntryLocation) -> SysResult<BasicFatEntry> {
        let chain = self.collect_chain(location.directory_start_cluster)?;
        let total = chain.len() * self.entries_per_cluster();
        let mut pending = Vec::new();
        for index in location.index_in_directory as usize..total {
            let record = self.read_raw_record(&chain, index)?;
            match record.entry_type() {
                RawEntryType::LongFileName => pending.push(record),
                RawEntryType::Normal => {
                    pending.push(record);
                    return pack_entry(&pending).map_err(|_| SysError::InvalidArgument);
                }
                _ => return Err(SysError::InvalidArgument),
            }
        }
        Err(SysError::InvalidArgument)
    }

    /// Rewrite the normal record of the entry at `location` (metadata
    /// updates: size, timestamps, start cluster). The name is untouched.
    pub fn update_entry(&self, location: FatEntryLocation, entry: &BasicFatEntry) -> SysResult<()> {
        let chain = self.collect_chain(location.directory_start_cluster)?;
        let total = chain.len() * self.entries_per_cluster();
        for index in location.index_in_directory as usize..total {
            let record = self.read_raw_record(&chain, index)?;
            match record.entry_type() {
                RawEntryType::Normal => {
                    let updated = RawFatEntry::from_basic(record.short_name(), entry);
                    return self.write_raw_record(&chain, index, &updated);
                }
                RawEntryType::LongFileName => continue,
                _ => return Err(SysError::IoError),
            }
        }
        Err(SysError::IoError)
    }

    /// Short names currently used in the directory (collision avoidance).
    pub fn short_names_of(&self, start_cluster: u32) -> SysResult<Vec<super::dir::ShortName>> {
        let chain = self.collect_chain(start_cluster)?;
        let total = chain.len() * self.entries_per_cluster();
        let mut names = Vec::new();
        for index in 0..total {
            let record = self.read_raw_record(&chain, index)?;
            match record.entry_type() {
                RawEntryType::EndOfDirectory => break,
                RawEntryType::Normal => names.push(record.short_name()),
                _ => {}
            }
        }
        Ok(names)
    }

    /// Write `records` (an LFN run plus its normal record) into the
    /// directory chain starting at `dir_start_cluster`, extending the
    /// directory by a cluster when no free run exists.
    pub fn insert_records(
        &self,
        dir_start_cluster: u32,
        records: &[RawFatEntry],
    ) -> SysResult<FatEntryLocation> {
        let mut chain = self.collect_chain(dir_start_cluster)?;
        let per_cluster = self.entries_per_cluster();
        let mut total = chain.len() * per_cluster;

        // Find a run of `records.len()` reusable slots.
        let mut run_start = None;
        let mut run_len = 0usize;
        let mut end_marker = None;
        let mut index = 0usize;
        while index < total {
            let record = self.read_raw_record(&chain, index)?;
            match record.entry_type() {
                RawEntryType::Deleted => {
                    if run_len == 0 {
                        run_start = Some(index);
                    }
                    run_len += 1;
                    if run_len == records.len() {
                        break;
                    }
                    index += 1;
                }
                RawEntryType::EndOfDirectory => {
                    end_marker = Some(index);
                    if run_len == 0 {
                        run_start = Some(index);
                    }
                    // Everything past the marker is free.
                    run_len = total - run_start.unwrap_or(index);
                    break;
                }
                _ => {
                    run_start = None;
                    run_len = 0;
                    index += 1;
                }
            }
        }

        let needed = records.len() + usize::from(end_marker.is_some());
        if run_start.is_none() || run_len < needed {
            if end_marker.is_none() {
                // No marker, no reusable run: append past the current end.
                run_start = Some(total);
            }
            // Extend with zeroed clusters until the tail run fits.
            while total - run_start.expect("set above or at the marker") < needed {
                let tail = *chain.last().expect("chain is never empty");
                let new_cluster = self.allocate_next_cluster(tail)?;
                {
                    let mut caches = self.caches.lock();
                    let item = self.fetch_cluster(&mut caches, new_cluster, false)?;
                    item.write(0, &alloc::vec![0u8; self.cluster_size()]);
                }
                chain.push(new_cluster);
                total += per_cluster;
            }
        }

        let start = run_start.expect("slot search always yields a start");
        for (i, record) in records.iter().enumerate() {
            self.write_raw_record(&chain, start + i, record)?;
        }
        // Keep the directory terminated when we consumed the marker.
        if let Some(marker) = end_marker {
            let next = start + records.len();
            if next >= marker && next < total {
                self.write_raw_record(&chain, next, &RawFatEntry::zeroed())?;
            }
        }
        Ok(FatEntryLocation {
            directory_start_cluster: dir_start_cluster,
            index_in_directory: start as u32,
        })
    }

    /// Mark every record of the entry at `location` deleted.
    pub fn delete_entry(&self, location: FatEntryLocation) -> SysResult<()> {
        let chain = self.collect_chain(location.directory_start_cluster)?;
        let total = chain.len() * self.entries_per_cluster();
        for index in location.index_in_directory as usize..total {
            let mut record = self.read_raw_record(&chain, index)?;
            let entry_type = record.entry_type();
            record.mark_deleted();
            self.write_raw_record(&chain, index, &record)?;
            match entry_type {
                RawEntryType::Normal => return Ok(()),
                RawEntryType::LongFileName => continue,
                _ => return Err(SysError::InvalidArgument),
            }
        }
        Err(SysError::InvalidArgument)
    }
}
