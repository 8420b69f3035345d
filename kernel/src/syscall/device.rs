//! Device syscalls: ListDevices / OpenDevice / CommandDevice.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::buffer::{self, read_user_string, TransactionalBuffer, UserBuffer};
use crate::drivers;
use crate::error::{SysError, SysResult};
use crate::process::entity::{DeviceHandle, Entity, SupportedOperations};
use crate::utils::align_up;

use super::abi::DEVICE_LIST_ITEM_NAME_OFFSET;
use super::current_handle;

/// Pack the registry into a record stream, filtered by protocol when
/// `protocol_filter` is non-zero. `Overflow` when the buffer cannot hold
/// every matching device.
pub fn sys_list_devices(buf: u64, len: u64, protocol_filter: u64) -> SysResult<i64> {
    let devices: Vec<(String, u64)> = drivers::with_registry(|registry| {
        let mut listed = Vec::new();
        registry.for_each_device(|name, device| {
            let protocol = device.userspace_protocol().map(|p| p as u64).unwrap_or(0);
            if protocol_filter == 0 || protocol == protocol_filter {
                listed.push((String::from(name), protocol));
            }
        });
        listed
    });

    let mut user = UserBuffer::new(buf as usize, len as usize);
    let mut written = 0usize;
    let mut last_record_at = None;
    for (name, protocol) in &devices {
        let record_size = align_up(DEVICE_LIST_ITEM_NAME_OFFSET + name.len() + 1, 8);
        if written + record_size > len as usize {
            return Err(SysError::Overflow);
        }
        buffer::write_object(&mut user, &(record_size as u64), written)?;
        buffer::write_object(&mut user, &(*protocol as u32), written + 8)?;
        user.write_from(name.as_bytes(), written + DEVICE_LIST_ITEM_NAME_OFFSET)?;
        user.write_from(&[0], written + DEVICE_LIST_ITEM_NAME_OFFSET + name.len())?;
        last_record_at = Some(written);
        written += record_size;
    }
    if let Some(at) = last_record_at {
        buffer::write_object(&mut user, &0u64, at)?;
    }
    Ok(0)
}

pub fn sys_open_device(path_ptr: u64, path_len: u64) -> SysResult<i64> {
    let name = read_user_string(path_ptr as usize, path_len as usize)?;
    let device = drivers::with_registry(|registry| registry.get(&name))
        .ok_or(SysError::NoSuchDevice)?;
    let handle = Arc::new(Entity::Device(DeviceHandle::new(device)));
    crate::process::with_current_process(|process| {
        process
            .userspace
            .as_mut()
            .map(|userspace| userspace.allocate_handle_slot(handle.clone(), 0))
            .ok_or(SysError::NotSupported)
    })
    .ok_or(SysError::Failed)?
}

pub fn sys_command_device(slot: i64, id: u64, buf: u64, len: u64) -> SysResult<i64> {
    let handle = current_handle(slot)?;
    if !handle
        .supported_operations()
        .contains(SupportedOperations::MESSAGE)
    {
        return Err(SysError::NotSupported);
    }
    let mut user = UserBuffer::new(buf as usize, len as usize);
    handle.message(id, &mut user)
}
