//! Entity handles: the kernel objects behind user file descriptors.
//!
//! The variant set is closed, so [`Entity`] is a tagged enum; every
//! descriptor-facing operation dispatches here, returning `NotSupported`
//! for operations a variant does not implement.

use alloc::sync::Arc;

use spin::Mutex;

use crate::buffer::TransactionalBuffer;
use crate::drivers::Device;
use crate::error::{SysError, SysResult};
use crate::fs::EntryRef;
use crate::interlink::{ConnectionHandle, ServerHandle};

use bitflags::bitflags;

use super::pipe::PipeHandle;

/// Sentinel offset: "use the handle's own cursor".
pub const INVALID_OFFSET: u64 = u64::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SupportedOperations: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const SEEK = 1 << 2;
        const MESSAGE = 1 << 3;
        const CONFIGURE = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    File,
    Device,
    Null,
    Pipe,
    InterlinkServer,
    InterlinkConnection,
}

/// Anchor of a `Seek` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SeekLocation {
    Start = 0,
    Current = 1,
    End = 2,
}

impl SeekLocation {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Start,
            1 => Self::Current,
            2 => Self::End,
            _ => return None,
        })
    }
}

/// A kernel object a process may hold a descriptor to.
pub enum Entity {
    File(FileHandle),
    Pipe(PipeHandle),
    Device(DeviceHandle),
    Null,
    InterlinkServer(ServerHandle),
    InterlinkConnection(ConnectionHandle),
}

pub type EntityRef = Arc<Entity>;

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::File(_) => EntityKind::File,
            Self::Pipe(_) => EntityKind::Pipe,
            Self::Device(_) => EntityKind::Device,
            Self::Null => EntityKind::Null,
            Self::InterlinkServer(_) => EntityKind::InterlinkServer,
            Self::InterlinkConnection(_) => EntityKind::InterlinkConnection,
        }
    }

    pub fn supported_operations(&self) -> SupportedOperations {
        match self {
            Self::File(file) => file.supported_operations(),
            Self::Pipe(pipe) => pipe.supported_operations(),
            Self::Device(_) => SupportedOperations::MESSAGE,
            Self::Null => SupportedOperations::READ | SupportedOperations::WRITE,
            Self::InterlinkServer(_) | Self::InterlinkConnection(_) => {
                SupportedOperations::empty()
            }
        }
    }

    /// Read into `buffer`. `offset == INVALID_OFFSET` means "no position
    /// supplied": stream handles ignore it, file handles use their
    /// cursor.
    pub fn read(&self, offset: u64, buffer: &mut dyn TransactionalBuffer) -> SysResult<usize> {
        match self {
            Self::File(file) => file.read(offset, buffer),
            Self::Pipe(pipe) => pipe.read(buffer),
            Self::Null => Ok(0),
            _ => Err(SysError::NotSupported),
        }
    }

    pub fn write(&self, offset: u64, buffer: &dyn TransactionalBuffer) -> SysResult<usize> {
        match self {
            Self::File(file) => file.write(offset, buffer),
            Self::Pipe(pipe) => pipe.write(buffer),
            Self::Null => Ok(buffer.size()),
            _ => Err(SysError::NotSupported),
        }
    }

    pub fn seek(&self, location: SeekLocation, offset: i64) -> SysResult<usize> {
        match self {
            Self::File(file) => file.seek(location, offset),
            _ => Err(SysError::NotSupported),
        }
    }

    pub fn message(&self, id: u64, buffer: &mut dyn TransactionalBuffer) -> SysResult<i64> {
        match self {
            Self::Device(device) => device.message(id, buffer),
            _ => Err(SysError::NotSupported),
        }
    }

    pub fn configure(&self, item: u64, buffer: &mut dyn TransactionalBuffer) -> SysResult<i64> {
        let _ = (item, buffer);
        Err(SysError::NotSupported)
    }

    /// The filesystem entry behind the handle, if it is file-backed.
    pub fn backing_entry(&self) -> Option<EntryRef> {
        match self {
            Self::File(file) => Some(file.entry().clone()),
            _ => None,
        }
    }

    /// Build a connected pipe pair.
    pub fn create_pipe(read_blocking: bool, write_blocking: bool) -> PipeEnds {
        let pipe = super::pipe::Pipe::new();
        PipeEnds {
            reader: Arc::new(Entity::Pipe(PipeHandle::reader(pipe.clone(), read_blocking))),
            writer: Arc::new(Entity::Pipe(PipeHandle::writer(pipe, write_blocking))),
        }
    }
}

/// The two descriptors of a fresh pipe.
pub struct PipeEnds {
    pub reader: EntityRef,
    pub writer: EntityRef,
}

/// One slot of a process's descriptor table.
#[derive(Clone)]
pub struct LocalEntityHandle {
    pub handle: EntityRef,
    /// Opaque tag carried alongside the slot.
    pub group: u8,
}

/// A file or directory opened through the filesystem.
pub struct FileHandle {
    entry: EntryRef,
    cursor: Mutex<usize>,
}

impl FileHandle {
    pub fn open(entry: EntryRef) -> Self {
        Self {
            entry,
            cursor: Mutex::new(0),
        }
    }

    pub fn entry(&self) -> &EntryRef {
        &self.entry
    }

    fn supported_operations(&self) -> SupportedOperations {
        if self.entry.is_directory() {
            SupportedOperations::empty()
        } else {
            SupportedOperations::READ | SupportedOperations::WRITE | SupportedOperations::SEEK
        }
    }

    fn read(&self, offset: u64, buffer: &mut dyn TransactionalBuffer) -> SysResult<usize> {
        let actual = if offset == INVALID_OFFSET {
            *self.cursor.lock()
        } else {
            offset as usize
        };
        let size = buffer.size();
        let read = self.entry.read_bytes(buffer, actual, size)?;
        *self.cursor.lock() = actual + read;
        Ok(read)
    }

    fn write(&self, offset: u64, buffer: &dyn TransactionalBuffer) -> SysResult<usize> {
        let actual = if offset == INVALID_OFFSET {
            *self.cursor.lock()
        } else {
            offset as usize
        };
        let written = self.entry.write_bytes(buffer, actual, buffer.size())?;
        *self.cursor.lock() = actual + written;
        Ok(written)
    }

    fn seek(&self, location: SeekLocation, offset: i64) -> SysResult<usize> {
        let start_point = match location {
            SeekLocation::Start => 0,
            SeekLocation::Current => *self.cursor.lock(),
            SeekLocation::End => self.entry.size(),
        };
        let target = start_point as i64 + offset;
        if target < 0 || target as usize > self.entry.size() {
            return Err(SysError::InvalidArgument);
        }
        *self.cursor.lock() = target as usize;
        Ok(target as usize)
    }
}

/// A probed device opened by name; messages are forwarded.
pub struct DeviceHandle {
    device: Arc<dyn Device>,
}

impl DeviceHandle {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device }
    }

    fn message(&self, id: u64, buffer: &mut dyn TransactionalBuffer) -> SysResult<i64> {
        self.device.on_userspace_message(id, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::KernelBuffer;
    use crate::fs::testfs::TestDir;

    #[test]
    fn null_entity_swallows_and_starves() {
        let null = Entity::Null;
        let mut data = [1u8, 2, 3];
        let buffer = KernelBuffer::new(&mut data);
        assert_eq!(null.write(INVALID_OFFSET, &buffer).unwrap(), 3);
        let mut out = [0u8; 3];
        let mut buffer = KernelBuffer::new(&mut out);
        assert_eq!(null.read(INVALID_OFFSET, &mut buffer).unwrap(), 0);
        assert_eq!(null.kind(), EntityKind::Null);
    }

    #[test]
    fn directory_handles_support_nothing() {
        let handle = Entity::File(FileHandle::open(TestDir::new("d")));
        assert_eq!(handle.supported_operations(), SupportedOperations::empty());
        assert_eq!(handle.kind(), EntityKind::File);
        // Operations outside the supported set fail.
        assert_eq!(
            handle.message(0, &mut KernelBuffer::new(&mut [])),
            Err(SysError::NotSupported)
        );
    }

    #[test]
    fn seek_is_bounded_by_size() {
        // TestDir has size 0, so only position 0 is reachable.
        let handle = FileHandle::open(TestDir::new("d"));
        assert_eq!(handle.seek(SeekLocation::Start, 0).unwrap(), 0);
        assert_eq!(handle.seek(SeekLocation::End, 0).unwrap(), 0);
        assert_eq!(
            handle.seek(SeekLocation::Start, 1),
            Err(SysError::InvalidArgument)
        );
        assert_eq!(
            handle.seek(SeekLocation::Current, -1),
            Err(SysError::InvalidArgument)
        );
    }
}
