//! File and directory syscalls.

use alloc::sync::Arc;

use crate::buffer::{self, read_user_string, TransactionalBuffer, UserBuffer};
use crate::error::{SysError, SysResult};
use crate::fs::{self, EntryRef};
use crate::process::entity::{Entity, FileHandle, SeekLocation, INVALID_OFFSET};
use crate::utils::align_up;

use super::abi::{FileKind, OpenFlags, Stat, FILE_LIST_ITEM_NAME_OFFSET};
use super::current_handle;

/// Resolve `path` against the caller's cwd (or `parent_fd` when
/// non-negative).
fn resolve_start(parent_fd: i64) -> SysResult<EntryRef> {
    if parent_fd >= 0 {
        let handle = current_handle(parent_fd)?;
        let entry = handle.backing_entry().ok_or(SysError::BadHandle)?;
        if !entry.is_directory() {
            return Err(SysError::NotADirectory);
        }
        Ok(entry)
    } else {
        crate::process::with_current_process(|process| {
            process
                .userspace
                .as_ref()
                .map(|userspace| userspace.cwd.clone())
                .ok_or(SysError::NotSupported)
        })
        .ok_or(SysError::Failed)?
    }
}

pub fn sys_open(
    path_ptr: u64,
    path_len: u64,
    raw_flags: u64,
    parent_fd: i64,
    stat_out: u64,
) -> SysResult<i64> {
    let flags = OpenFlags::from_bits(raw_flags).ok_or(SysError::InvalidArgument)?;
    let path = read_user_string(path_ptr as usize, path_len as usize)?;
    let start = resolve_start(parent_fd)?;

    let mut parent = None;
    let entry = match fs::full_path_lookup(start, &path, Some(&mut parent)) {
        Ok(entry) => {
            if flags.contains(OpenFlags::CREATE_ONLY) {
                return Err(SysError::Exists);
            }
            entry
        }
        Err(SysError::NoEntry)
            if flags.intersects(OpenFlags::CREATE_IF_MISSING | OpenFlags::CREATE_ONLY) =>
        {
            let parent = parent.ok_or(SysError::NoEntry)?;
            let name = path
                .rsplit('/')
                .find(|component| !component.is_empty())
                .ok_or(SysError::InvalidArgument)?;
            parent.add_child(name, flags.contains(OpenFlags::DIRECTORY))?
        }
        Err(error) => return Err(error),
    };

    if flags.contains(OpenFlags::DIRECTORY) && !entry.is_directory() {
        return Err(SysError::NotADirectory);
    }

    if stat_out != 0 {
        let stat = stat_for(&entry);
        let mut out = UserBuffer::new(stat_out as usize, core::mem::size_of::<Stat>());
        buffer::write_object(&mut out, &stat, 0)?;
    }

    let handle = Arc::new(Entity::File(FileHandle::open(entry)));
    crate::process::with_current_process(|process| {
        process
            .userspace
            .as_mut()
            .map(|userspace| userspace.allocate_handle_slot(handle.clone(), 0))
            .ok_or(SysError::NotSupported)
    })
    .ok_or(SysError::Failed)?
}

fn stat_for(entry: &EntryRef) -> Stat {
    Stat::new(
        entry.size() as u64,
        if entry.is_directory() {
            FileKind::Directory
        } else {
            FileKind::File
        },
    )
}

pub fn sys_close(slot: i64) -> SysResult<i64> {
    let handle = current_handle(slot)?;
    // Push metadata for file-backed handles on their way out.
    if let Some(entry) = handle.backing_entry() {
        entry.flush()?;
    }
    crate::process::with_current_process(|process| {
        process
            .userspace
            .as_mut()
            .ok_or(SysError::NotSupported)
            .and_then(|userspace| userspace.close_handle_slot(slot))
    })
    .ok_or(SysError::Failed)??;
    Ok(0)
}

pub fn sys_read(slot: i64, offset: u64, buf: u64, len: u64) -> SysResult<i64> {
    let handle = current_handle(slot)?;
    let mut user = UserBuffer::new(buf as usize, len as usize);
    let read = handle.read(offset, &mut user)?;
    Ok(read as i64)
}

pub fn sys_write(slot: i64, offset: u64, buf: u64, len: u64) -> SysResult<i64> {
    let handle = current_handle(slot)?;
    let user = UserBuffer::new(buf as usize, len as usize);
    let written = handle.write(offset, &user)?;
    Ok(written as i64)
}

pub fn sys_seek(slot: i64, raw_location: u64, offset: i64) -> SysResult<i64> {
    let handle = current_handle(slot)?;
    let location = SeekLocation::from_raw(raw_location).ok_or(SysError::InvalidArgument)?;
    let cursor = handle.seek(location, offset)?;
    Ok(cursor as i64)
}

pub fn sys_stat(
    slot: i64,
    path_ptr: u64,
    path_len: u64,
    _follow_symlinks: bool,
    stat_out: u64,
) -> SysResult<i64> {
    let entry = if slot >= 0 {
        current_handle(slot)?
            .backing_entry()
            .ok_or(SysError::BadHandle)?
    } else {
        let path = read_user_string(path_ptr as usize, path_len as usize)?;
        let start = resolve_start(-1)?;
        fs::full_path_lookup(start, &path, None)?
    };
    let stat = stat_for(&entry);
    let mut out = UserBuffer::new(stat_out as usize, core::mem::size_of::<Stat>());
    buffer::write_object(&mut out, &stat, 0)?;
    Ok(0)
}

/// Pack directory entries as a stream of records starting at child index
/// `offset`; returns bytes written (0 at the end of the directory).
pub fn sys_get_directory_entries(slot: i64, offset: u64, buf: u64, len: u64) -> SysResult<i64> {
    let handle = current_handle(slot)?;
    let entry = handle.backing_entry().ok_or(SysError::BadHandle)?;
    if !entry.is_directory() {
        return Err(SysError::NotADirectory);
    }
    let children = entry.all_children()?;
    let remaining = &children[children.len().min(offset as usize)..];
    let mut user = UserBuffer::new(buf as usize, len as usize);

    let mut written = 0usize;
    let mut emitted = 0usize;
    let mut last_record_at = None;
    for child in remaining {
        let name = child.name();
        let record_size = align_up(FILE_LIST_ITEM_NAME_OFFSET + name.len() + 1, 8);
        if written + record_size > len as usize {
            if emitted == 0 {
                return Err(SysError::Overflow);
            }
            break;
        }
        buffer::write_object(&mut user, &(record_size as u64), written)?;
        buffer::write_object(&mut user, &(child.size() as u64), written + 8)?;
        let kind: u8 = if child.is_directory() { 1 } else { 0 };
        buffer::write_object(&mut user, &kind, written + 16)?;
        user.write_from(name.as_bytes(), written + FILE_LIST_ITEM_NAME_OFFSET)?;
        user.write_from(&[0], written + FILE_LIST_ITEM_NAME_OFFSET + name.len())?;
        last_record_at = Some(written);
        written += record_size;
        emitted += 1;
    }

    // A zero next_offset marks the end of the directory; it only goes out
    // when every remaining child was emitted in this batch.
    if emitted == remaining.len() {
        if let Some(at) = last_record_at {
            buffer::write_object(&mut user, &0u64, at)?;
        }
    }
    Ok(written as i64)
}

pub fn sys_duplicate(old_slot: i64, new_slot: i64, group: u8) -> SysResult<i64> {
    let handle = current_handle(old_slot)?;
    crate::process::with_current_process(|process| {
        let userspace = process.userspace.as_mut().ok_or(SysError::NotSupported)?;
        if new_slot < 0 {
            Ok(userspace.allocate_handle_slot(handle.clone(), group))
        } else {
            userspace.set_handle_slot(new_slot, handle.clone(), group)
        }
    })
    .ok_or(SysError::Failed)?
}

pub fn sys_change_working_directory(path_ptr: u64, path_len: u64) -> SysResult<i64> {
    let path = read_user_string(path_ptr as usize, path_len as usize)?;
    let start = resolve_start(-1)?;
    let target = fs::full_path_lookup(start, &path, None)?;
    if !target.is_directory() {
        return Err(SysError::NotADirectory);
    }
    crate::process::with_current_process(|process| {
        process
            .userspace
            .as_mut()
            .map(|userspace| userspace.cwd = target.clone())
            .ok_or(SysError::NotSupported)
    })
    .ok_or(SysError::Failed)??;
    Ok(0)
}

/// Shared by handlers that bypass the cursor plumbing.
#[allow(dead_code)]
pub(crate) fn read_at_cursor(slot: i64, buf: u64, len: u64) -> SysResult<i64> {
    sys_read(slot, INVALID_OFFSET, buf, len)
}
