//! Process syscalls: GetPid / Fork / Exec / Exit / Wait.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{InterruptContext, SPSR_EL0T};
use crate::buffer::{self, read_user_string, UserBuffer};
use crate::error::{SysError, SysResult};
use crate::fs;
use crate::mm::SpaceManager;
use crate::process::UserspaceState;

pub fn sys_get_pid() -> SysResult<i64> {
    crate::process::current_pid().ok_or(SysError::Failed)
}

pub fn sys_fork(ctx: &mut InterruptContext) -> SysResult<i64> {
    crate::process::fork_current(ctx)
}

pub fn sys_exit(code: i32) -> SysResult<i64> {
    crate::process::quit_current(code)
}

pub fn sys_wait(pid: i64, status_out: u64) -> SysResult<i64> {
    let (reaped, code) = crate::process::wait_for_child(pid)?;
    if status_out != 0 {
        let mut out = UserBuffer::new(status_out as usize, core::mem::size_of::<i64>());
        buffer::write_object(&mut out, &(code as i64), 0)?;
    }
    Ok(reaped)
}

/// An argv/envp element: `(ptr, len)` pairs in user memory.
fn read_string_array(array_ptr: u64, count: u64) -> SysResult<Vec<String>> {
    const MAX_ARGS: u64 = 64;
    if count > MAX_ARGS {
        return Err(SysError::OutOfRange);
    }
    let mut strings = Vec::with_capacity(count as usize);
    for index in 0..count {
        let element = UserBuffer::new((array_ptr + index * 16) as usize, 16);
        let ptr: u64 = buffer::read_object(&element, 0)?;
        let len: u64 = buffer::read_object(&element, 8)?;
        strings.push(read_user_string(ptr as usize, len as usize)?);
    }
    Ok(strings)
}

/// Replace the calling process's image.
///
/// On success the interrupt context is rewritten to enter the new program
/// and the returned value (argc) lands in x0 through the normal syscall
/// return path.
pub fn sys_exec(
    path_ptr: u64,
    path_len: u64,
    argv_ptr: u64,
    argc: u64,
    envp_ptr: u64,
    envc: u64,
    ctx: &mut InterruptContext,
) -> SysResult<i64> {
    let path = read_user_string(path_ptr as usize, path_len as usize)?;
    let argv = if argv_ptr != 0 {
        read_string_array(argv_ptr, argc)?
    } else {
        Vec::new()
    };
    let envp = if envp_ptr != 0 {
        read_string_array(envp_ptr, envc)?
    } else {
        Vec::new()
    };

    let (cwd, executable) = {
        let cwd = crate::process::with_current_process(|process| {
            process
                .userspace
                .as_ref()
                .map(|userspace| userspace.cwd.clone())
                .ok_or(SysError::NotSupported)
        })
        .ok_or(SysError::Failed)??;
        let executable = fs::full_path_lookup(cwd.clone(), &path, None)?;
        (cwd, executable)
    };
    if executable.is_directory() {
        return Err(SysError::NotADirectory);
    }

    // Build the replacement address space fully before tearing down the
    // caller's: a failed exec leaves the old image untouched.
    let mut space_manager = SpaceManager::create()?;
    let image = crate::elf::load_executable(&executable, &mut space_manager)?;
    let stack = crate::elf::build_user_stack(&mut space_manager, &argv, &envp)?;

    let new_root = space_manager.raw_root_ptr();
    let old_userspace = crate::process::with_current_process(|process| {
        let userspace = process.userspace.as_mut().ok_or(SysError::NotSupported)?;
        let open_entities = core::mem::take(&mut userspace.open_entities);
        let old = core::mem::replace(
            userspace,
            UserspaceState {
                user_stack_top: stack.stack_pointer,
                cwd,
                space_manager,
                open_entities,
            },
        );
        process.name = path;
        Ok::<UserspaceState, SysError>(old)
    })
    .ok_or(SysError::Failed)??;

    // Switch to the fresh tables before the old ones are torn down.
    crate::arch::switch_user_address_space(new_root);
    drop(old_userspace);

    ctx.x = [0; 31];
    ctx.elr_el1 = image.entry_point as u64;
    ctx.spsr_el1 = SPSR_EL0T;
    ctx.sp_el0 = stack.stack_pointer as u64;
    Ok(stack.arg0 as i64)
}
