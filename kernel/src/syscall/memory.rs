//! Memory syscalls: Allocate / Deallocate.

use crate::error::{SysError, SysResult};
use crate::mm::MemoryOperation;

use super::abi::INVALID_ADDRESS_VAL;

pub fn sys_allocate(addr_hint: u64, size: u64, _flags: u64) -> SysResult<i64> {
    if size == 0 {
        return Err(SysError::InvalidArgument);
    }
    let hint = if addr_hint == INVALID_ADDRESS_VAL {
        None
    } else {
        Some(addr_hint as usize)
    };
    let region = crate::process::with_current_space_manager(|sm| {
        sm.allocate_flexible_region(
            size as usize,
            MemoryOperation::READ | MemoryOperation::WRITE,
            "allocation",
            hint,
        )
    })
    .ok_or(SysError::Failed)??;
    Ok(region.start.get() as i64)
}

pub fn sys_deallocate(addr: u64, size: u64) -> SysResult<i64> {
    crate::process::with_current_space_manager(|sm| {
        sm.deallocate_userspace_region(addr as usize, size as usize)
    })
    .ok_or(SysError::Failed)??;
    Ok(0)
}
