//! FAT directory record codecs: 8.3 short names, long-filename chains,
//! and the packed 32-byte entry layout.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{SysError, SysResult};
use crate::utils::time::{
    datetime_from_dos, dos_date_from, dos_time_from, UnixTimestamp,
};

/// Size of one raw directory record.
pub const RAW_ENTRY_SIZE: usize = 32;

/// Attribute bit marking a subdirectory.
pub const ATTR_DIRECTORY: u8 = 0x10;
/// All four low attribute bits set marks a long-filename record.
const ATTR_LFN: u8 = 0x0F;

const DELETED_MARKER: u8 = 0xE5;

/// Characters a long filename packs per LFN record (5 + 6 + 2 UCS-2).
pub const CHARS_PER_LFN: usize = 13;

/// Classification of a raw 32-byte record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEntryType {
    Normal,
    EndOfDirectory,
    Deleted,
    LongFileName,
}

/// One raw directory record.
#[derive(Debug, Clone, Copy)]
pub struct RawFatEntry(pub [u8; RAW_ENTRY_SIZE]);

impl RawFatEntry {
    pub const fn zeroed() -> Self {
        Self([0; RAW_ENTRY_SIZE])
    }

    pub fn entry_type(&self) -> RawEntryType {
        if self.0[0] == 0 {
            RawEntryType::EndOfDirectory
        } else if self.0[0] == DELETED_MARKER {
            RawEntryType::Deleted
        } else if self.0[11] & ATTR_LFN == ATTR_LFN {
            RawEntryType::LongFileName
        } else {
            RawEntryType::Normal
        }
    }

    pub fn mark_deleted(&mut self) {
        self.0[0] = DELETED_MARKER;
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.0[offset], self.0[offset + 1]])
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.0[offset],
            self.0[offset + 1],
            self.0[offset + 2],
            self.0[offset + 3],
        ])
    }

    // Normal-entry field accessors.

    pub fn short_name(&self) -> ShortName {
        let mut name = [0u8; 11];
        name.copy_from_slice(&self.0[0..11]);
        ShortName(name)
    }

    pub fn attributes(&self) -> u8 {
        self.0[11]
    }

    pub fn first_cluster(&self) -> u32 {
        (self.u16_at(26) as u32) | ((self.u16_at(20) as u32) << 16)
    }

    pub fn file_size(&self) -> u32 {
        self.u32_at(28)
    }

    pub fn create_timestamp(&self) -> u64 {
        UnixTimestamp::from_decomposed(datetime_from_dos(self.u16_at(16), self.u16_at(14)))
            .seconds()
    }

    pub fn access_timestamp(&self) -> u64 {
        UnixTimestamp::from_decomposed(datetime_from_dos(self.u16_at(18), 0)).seconds()
    }

    pub fn modify_timestamp(&self) -> u64 {
        UnixTimestamp::from_decomposed(datetime_from_dos(self.u16_at(24), self.u16_at(22)))
            .seconds()
    }

    /// Build a normal record from `entry` under `short_name`.
    pub fn from_basic(short_name: ShortName, entry: &BasicFatEntry) -> Self {
        let creation = UnixTimestamp::new(entry.creation_timestamp).decompose();
        let modified = UnixTimestamp::new(entry.modified_timestamp).decompose();

        let mut raw = [0u8; RAW_ENTRY_SIZE];
        raw[0..11].copy_from_slice(&short_name.0);
        raw[11] = entry.raw_attributes;
        raw[14..16].copy_from_slice(&dos_time_from(creation).to_le_bytes());
        raw[16..18].copy_from_slice(&dos_date_from(creation).to_le_bytes());
        raw[18..20].copy_from_slice(&dos_date_from(modified).to_le_bytes());
        raw[20..22].copy_from_slice(&((entry.data_cluster >> 16) as u16).to_le_bytes());
        raw[22..24].copy_from_slice(&dos_time_from(modified).to_le_bytes());
        raw[24..26].copy_from_slice(&dos_date_from(modified).to_le_bytes());
        raw[26..28].copy_from_slice(&(entry.data_cluster as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&entry.size.to_le_bytes());
        Self(raw)
    }

    // LFN-record accessors.

    pub fn lfn_order(&self) -> u8 {
        self.0[0]
    }

    pub fn lfn_checksum(&self) -> u8 {
        self.0[13]
    }

    /// The 13 UCS-2 characters of an LFN record, in name order.
    pub fn lfn_chars(&self) -> [u16; CHARS_PER_LFN] {
        let mut chars = [0u16; CHARS_PER_LFN];
        let ranges: [(usize, usize); 3] = [(1, 5), (14, 6), (28, 2)];
        let mut out = 0;
        for (start, count) in ranges {
            for i in 0..count {
                chars[out] = self.u16_at(start + i * 2);
                out += 1;
            }
        }
        chars
    }

    /// Build one LFN record.
    pub fn lfn_record(order: u8, checksum: u8, chars: &[u16; CHARS_PER_LFN]) -> Self {
        let mut raw = [0u8; RAW_ENTRY_SIZE];
        raw[0] = order;
        raw[11] = ATTR_LFN;
        raw[13] = checksum;
        let ranges: [(usize, usize); 3] = [(1, 5), (14, 6), (28, 2)];
        let mut index = 0;
        for (start, count) in ranges {
            for i in 0..count {
                raw[start + i * 2..start + i * 2 + 2].copy_from_slice(&chars[index].to_le_bytes());
                index += 1;
            }
        }
        Self(raw)
    }
}

/// An 8.3 name in its on-disk padded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName(pub [u8; 11]);

impl ShortName {
    /// Render for display: `BASE.EXT` with padding stripped.
    pub fn to_display(&self) -> String {
        let base_len = self.0[..8].iter().take_while(|&&c| c != b' ').count();
        let ext_len = self.0[8..].iter().take_while(|&&c| c != b' ').count();
        let mut out = String::with_capacity(base_len + 1 + ext_len);
        for &byte in &self.0[..base_len] {
            out.push(byte as char);
        }
        if ext_len > 0 {
            out.push('.');
            for &byte in &self.0[8..8 + ext_len] {
                out.push(byte as char);
            }
        }
        out
    }

    /// Checksum linking LFN records to their short entry: an unsigned
    /// rotate-right accumulate over all 11 bytes.
    pub fn checksum(&self) -> u8 {
        let mut checksum = 0u8;
        for &byte in &self.0 {
            checksum = (if checksum & 1 != 0 { 0x80u8 } else { 0 })
                .wrapping_add(checksum >> 1)
                .wrapping_add(byte);
        }
        checksum
    }
}

fn is_valid_fat_char(c: u8) -> bool {
    if c.is_ascii_uppercase() || c.is_ascii_digit() || c >= 128 {
        return true;
    }
    matches!(
        c,
        b' ' | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'-' | b'`' | b'{'
            | b'}' | b'~'
    )
}

/// Derive a unique 8.3 short name for `full_name`.
///
/// Uppercases, strips leading dots/spaces, maps invalid characters to
/// `_`, truncates base to 8 and extension to 3 characters. Collisions
/// against `existing` get a `~N` tail overwriting the end of the base.
pub fn generate_short_name(full_name: &str, existing: &[ShortName]) -> ShortName {
    let mut name = ShortName([b' '; 11]);

    if full_name == "." {
        name.0[0] = b'.';
        return name;
    }
    if full_name == ".." {
        name.0[0] = b'.';
        name.0[1] = b'.';
        return name;
    }

    let trimmed = full_name.trim_start_matches(['.', ' ']);
    let bytes = trimmed.as_bytes();

    let mut base_len = 0;
    let mut index = 0;
    while index < bytes.len() && bytes[index] != b'.' && base_len < 8 {
        let c = bytes[index];
        index += 1;
        if c == b' ' {
            continue;
        }
        name.0[base_len] = if c.is_ascii_lowercase() {
            c - 32
        } else if is_valid_fat_char(c) {
            c
        } else {
            b'_'
        };
        base_len += 1;
    }

    // Extension from the last dot, if any.
    if let Some(dot) = trimmed.rfind('.') {
        let ext = &trimmed.as_bytes()[dot + 1..];
        let mut ext_len = 0;
        for &c in ext {
            if ext_len >= 3 {
                break;
            }
            if c == b' ' {
                continue;
            }
            name.0[8 + ext_len] = if c.is_ascii_lowercase() {
                c - 32
            } else if is_valid_fat_char(c) {
                c
            } else {
                b'_'
            };
            ext_len += 1;
        }
    }

    // Numeric tail on collision.
    let mut number = 0u32;
    while existing.contains(&name) {
        number += 1;
        let tail = alloc::format!("~{}", number);
        let insert_at = (base_len).min(8 - tail.len());
        name.0[insert_at..insert_at + tail.len()].copy_from_slice(tail.as_bytes());
    }
    name
}

/// Decoded directory entry, independent of its on-disk encoding.
#[derive(Debug, Clone)]
pub struct BasicFatEntry {
    pub name: String,
    pub creation_timestamp: u64,
    pub accessed_timestamp: u64,
    pub modified_timestamp: u64,
    pub size: u32,
    pub data_cluster: u32,
    pub raw_attributes: u8,
}

impl BasicFatEntry {
    pub fn is_directory(&self) -> bool {
        self.raw_attributes & ATTR_DIRECTORY != 0
    }
}

/// Position of an entry: the directory's first cluster plus the record
/// index of the entry's first (LFN) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatEntryLocation {
    pub directory_start_cluster: u32,
    pub index_in_directory: u32,
}

/// Reassemble one entry from its LFN records plus final normal record.
///
/// LFN validation: the first record carries `0x40 | n`, orders descend to
/// 1, and every checksum matches the short name. Any violation falls back
/// to an error so the caller can discard the partial entry.
pub fn pack_entry(records: &[RawFatEntry]) -> SysResult<BasicFatEntry> {
    let Some((normal, lfn_records)) = records.split_last() else {
        return Err(SysError::InvalidArgument);
    };
    if normal.entry_type() != RawEntryType::Normal {
        return Err(SysError::InvalidArgument);
    }

    let name = match extract_long_name(lfn_records, normal.short_name().checksum()) {
        Ok(name) => name,
        Err(_) if lfn_records.is_empty() => normal.short_name().to_display(),
        Err(error) => return Err(error),
    };

    Ok(BasicFatEntry {
        name,
        creation_timestamp: normal.create_timestamp(),
        accessed_timestamp: normal.access_timestamp(),
        modified_timestamp: normal.modify_timestamp(),
        size: normal.file_size(),
        data_cluster: normal.first_cluster(),
        raw_attributes: normal.attributes(),
    })
}

fn extract_long_name(lfn_records: &[RawFatEntry], checksum: u8) -> SysResult<String> {
    if lfn_records.is_empty() {
        return Err(SysError::InvalidArgument);
    }
    let first = &lfn_records[0];
    if first.lfn_order() & 0x40 == 0 {
        return Err(SysError::InvalidArgument);
    }
    let n = (first.lfn_order() & 0x3F) as usize;
    if n != lfn_records.len() {
        return Err(SysError::InvalidArgument);
    }

    let mut name = String::new();
    // Records are stored last-chunk-first; orders descend from n to 1.
    for (i, record) in lfn_records.iter().enumerate() {
        if (record.lfn_order() & 0x3F) as usize != n - i {
            return Err(SysError::InvalidArgument);
        }
        if record.lfn_checksum() != checksum {
            return Err(SysError::InvalidArgument);
        }
    }
    for record in lfn_records.iter().rev() {
        for c in record.lfn_chars() {
            if c == 0 {
                return Ok(name);
            }
            name.push(char::from_u32(c as u32).unwrap_or('\u{FFFD}'));
        }
    }
    Ok(name)
}

/// Encode `name` as a chain of LFN records (stored order: last chunk
/// first) for a short entry with `checksum`.
pub fn build_lfn_records(name: &str, checksum: u8) -> Vec<RawFatEntry> {
    let chars: Vec<u16> = name.encode_utf16().collect();
    let record_count = chars.len().div_ceil(CHARS_PER_LFN).max(1);

    let mut records = Vec::with_capacity(record_count);
    for order in (1..=record_count).rev() {
        let mut chunk = [0xFFFFu16; CHARS_PER_LFN];
        let start = (order - 1) * CHARS_PER_LFN;
        for (i, slot) in chunk.iter_mut().enumerate() {
            match start + i {
                pos if pos < chars.len() => *slot = chars[pos],
                pos if pos == chars.len() => *slot = 0,
                _ => {}
            }
        }
        let order_byte = if order == record_count {
            0x40 | order as u8
        } else {
            order as u8
        };
        records.push(RawFatEntry::lfn_record(order_byte, checksum, &chunk));
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_generation_basics() {
        let name = generate_short_name("hello.txt", &[]);
        assert_eq!(&name.0, b"HELLO   TXT");
        assert_eq!(name.to_display(), "HELLO.TXT");

        let name = generate_short_name("Goodbye Cruel World.text", &[]);
        assert_eq!(&name.0, b"GOODBYECTEX");

        // Invalid characters map to underscores.
        let name = generate_short_name("a+b=c", &[]);
        assert_eq!(&name.0[..8], b"A_B_C   ");

        // Leading dots are stripped (dotfiles still get a name).
        let name = generate_short_name(".config", &[]);
        assert_eq!(&name.0[..8], b"CONFIG  ");
    }

    #[test]
    fn short_name_collisions_get_numeric_tails() {
        let first = generate_short_name("document.txt", &[]);
        assert_eq!(&first.0, b"DOCUMENTTXT");
        let second = generate_short_name("documents.txt", &[first]);
        assert_eq!(&second.0, b"DOCUME~1TXT");
        let third = generate_short_name("documental.txt", &[first, second]);
        assert_eq!(&third.0, b"DOCUME~2TXT");
    }

    #[test]
    fn dot_entries_are_special() {
        assert_eq!(&generate_short_name(".", &[]).0, b".          ");
        assert_eq!(&generate_short_name("..", &[]).0, b"..         ");
    }

    #[test]
    fn lfn_round_trip_with_checksum() {
        let short = generate_short_name("GoodbyeCruel WorTXT", &[]);
        let checksum = short.checksum();
        let mut records = build_lfn_records("GoodbyeCruel WorTXT", checksum);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lfn_order(), 0x42);
        assert_eq!(records[1].lfn_order(), 0x01);

        records.push(RawFatEntry::from_basic(
            short,
            &BasicFatEntry {
                name: String::new(),
                creation_timestamp: 0,
                accessed_timestamp: 0,
                modified_timestamp: 0,
                size: 42,
                data_cluster: 7,
                raw_attributes: 0,
            },
        ));
        let packed = pack_entry(&records).unwrap();
        assert_eq!(packed.name, "GoodbyeCruel WorTXT");
        assert_eq!(packed.size, 42);
        assert_eq!(packed.data_cluster, 7);
    }

    #[test]
    fn lfn_validation_rejects_bad_sequences() {
        let short = generate_short_name("longfilename.bin", &[]);
        let checksum = short.checksum();
        let normal = RawFatEntry::from_basic(
            short,
            &BasicFatEntry {
                name: String::new(),
                creation_timestamp: 0,
                accessed_timestamp: 0,
                modified_timestamp: 0,
                size: 1,
                data_cluster: 3,
                raw_attributes: 0,
            },
        );

        // Wrong checksum.
        let mut records = build_lfn_records("longfilename.bin", checksum.wrapping_add(1));
        records.push(normal);
        assert!(pack_entry(&records).is_err());

        // Orders out of sequence.
        let mut records = build_lfn_records("longfilename.bin", checksum);
        records.swap(0, 1);
        records.push(normal);
        assert!(pack_entry(&records).is_err());

        // A bare normal entry still packs via its short name.
        let packed = pack_entry(&[normal]).unwrap();
        assert_eq!(packed.name, "LONGFI~1.BIN");
    }

    #[test]
    fn raw_entry_field_round_trip() {
        let basic = BasicFatEntry {
            name: String::new(),
            creation_timestamp: 1_234_567_890,
            accessed_timestamp: 0,
            modified_timestamp: 1_234_567_890,
            size: 0xDEAD,
            data_cluster: 0x0012_3456,
            raw_attributes: ATTR_DIRECTORY,
        };
        let raw = RawFatEntry::from_basic(generate_short_name("subdir", &[]), &basic);
        assert_eq!(raw.entry_type(), RawEntryType::Normal);
        assert_eq!(raw.file_size(), 0xDEAD);
        assert_eq!(raw.first_cluster(), 0x0012_3456);
        assert_eq!(raw.attributes(), ATTR_DIRECTORY);
        // DOS time has 2-second resolution.
        assert!(raw.modify_timestamp().abs_diff(1_234_567_890) <= 2);
    }
}
