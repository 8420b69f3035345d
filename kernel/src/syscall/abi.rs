//! Userspace-visible ABI types shared by the syscall handlers.

use bitflags::bitflags;

use crate::buffer::Pod;

/// "No offset supplied" sentinel for Read/Write.
pub const INVALID_OFFSET_VAL: u64 = u64::MAX;

/// "Kernel chooses" sentinel for Allocate.
pub const INVALID_ADDRESS_VAL: u64 = u64::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u64 {
        const READ = 0x01;
        const WRITE = 0x02;
        const CREATE_IF_MISSING = 0x04;
        const CREATE_ONLY = 0x08;
        const DIRECTORY = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    File = 0,
    Directory = 1,
}

/// Result of `Stat`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub size: u64,
    /// 0 = file, 1 = directory.
    pub kind: u8,
    _pad: [u8; 7],
}

// SAFETY: repr(C), fixed padding, plain bytes.
unsafe impl Pod for Stat {}

impl Stat {
    pub fn new(size: u64, kind: FileKind) -> Self {
        Self {
            size,
            kind: kind as u8,
            _pad: [0; 7],
        }
    }
}

/// Out parameter of `CreatePipe`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CreatePipeHandles {
    pub read_handle: i64,
    pub write_handle: i64,
}

// SAFETY: repr(C) plain integers.
unsafe impl Pod for CreatePipeHandles {}

/// Flags word of `CreatePipe`, bit-cast from the low 32 bits of the
/// argument: `{read_group: u8, write_group: u8, read_blocking: bool,
/// write_blocking: bool}`.
#[derive(Debug, Clone, Copy)]
pub struct CreatePipeHandleFlags {
    pub read_group: u8,
    pub write_group: u8,
    pub read_blocking: bool,
    pub write_blocking: bool,
}

impl CreatePipeHandleFlags {
    pub fn from_raw(raw: u64) -> Self {
        let bytes = (raw as u32).to_le_bytes();
        Self {
            read_group: bytes[0],
            write_group: bytes[1],
            read_blocking: bytes[2] != 0,
            write_blocking: bytes[3] != 0,
        }
    }
}

/// `ListDevices` stream record header: `{next_offset: u64, protocol:
/// u32}` followed by the NUL-terminated name. A `next_offset` of 0 ends
/// the stream. Records are 8-byte aligned.
pub const DEVICE_LIST_ITEM_NAME_OFFSET: usize = 12;

/// `GetDirEntries` stream record header: `{next_offset: u64, size: u64,
/// kind: u8}` followed by the NUL-terminated name. A `next_offset` of 0
/// ends the stream. Records are 8-byte aligned.
pub const FILE_LIST_ITEM_NAME_OFFSET: usize = 17;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_flags_decode() {
        // read group 3, write group 7, read blocking, write non-blocking.
        let raw = u32::from_le_bytes([3, 7, 1, 0]) as u64;
        let flags = CreatePipeHandleFlags::from_raw(raw);
        assert_eq!(flags.read_group, 3);
        assert_eq!(flags.write_group, 7);
        assert!(flags.read_blocking);
        assert!(!flags.write_blocking);
    }

    #[test]
    fn stat_layout() {
        assert_eq!(core::mem::size_of::<Stat>(), 16);
        assert_eq!(core::mem::size_of::<CreatePipeHandles>(), 16);
    }
}
