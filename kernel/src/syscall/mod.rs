//! System call surface.
//!
//! The dispatcher receives the syscall number and seven raw arguments
//! from the exception path. Every user pointer is wrapped in a
//! [`UserBuffer`](crate::buffer::UserBuffer) before any access, so all
//! kernel/user transfers are permission-checked against the caller's
//! space manager. Errors are negated into the return register.

pub mod abi;

mod device;
mod filesystem;
mod ipc;
mod memory;
mod process;
mod time;

use crate::arch::InterruptContext;
use crate::error::{SysError, SysResult};

/// Syscall numbers, stable integer IDs in declaration order.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    // File operations.
    Open = 0,
    Close = 1,
    Read = 2,
    Write = 3,
    Seek = 4,
    Stat = 5,
    GetDirEntries = 6,
    Duplicate = 7,
    // Device operations.
    ListDevices = 8,
    OpenDevice = 9,
    CommandDevice = 10,
    // Memory operations.
    Allocate = 11,
    Deallocate = 12,
    // IPC.
    CreatePipe = 13,
    // Process.
    GetPid = 14,
    Fork = 15,
    Exec = 16,
    Exit = 17,
    Wait = 18,
    ChangeWorkingDirectory = 19,
    // Interlink.
    InterlinkAdvertise = 20,
    InterlinkConnect = 21,
    InterlinkAccept = 22,
    InterlinkSend = 23,
    InterlinkReceive = 24,
    // Miscellaneous.
    Sleep = 25,
    GetTicks = 26,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        Ok(match value {
            0 => Self::Open,
            1 => Self::Close,
            2 => Self::Read,
            3 => Self::Write,
            4 => Self::Seek,
            5 => Self::Stat,
            6 => Self::GetDirEntries,
            7 => Self::Duplicate,
            8 => Self::ListDevices,
            9 => Self::OpenDevice,
            10 => Self::CommandDevice,
            11 => Self::Allocate,
            12 => Self::Deallocate,
            13 => Self::CreatePipe,
            14 => Self::GetPid,
            15 => Self::Fork,
            16 => Self::Exec,
            17 => Self::Exit,
            18 => Self::Wait,
            19 => Self::ChangeWorkingDirectory,
            20 => Self::InterlinkAdvertise,
            21 => Self::InterlinkConnect,
            22 => Self::InterlinkAccept,
            23 => Self::InterlinkSend,
            24 => Self::InterlinkReceive,
            25 => Self::Sleep,
            26 => Self::GetTicks,
            _ => return Err(()),
        })
    }
}

/// Entry point from the exception vector: arguments in x0-x7 per the
/// syscall ABI, result written back to x0.
#[no_mangle]
pub extern "C" fn handle_syscall_entry(ctx: &mut InterruptContext) {
    let result = handle_syscall(
        ctx.x[0], ctx.x[1], ctx.x[2], ctx.x[3], ctx.x[4], ctx.x[5], ctx.x[6], ctx.x[7], ctx,
    );
    let value = match result {
        Ok(value) => value,
        Err(error) => error.to_return_value(),
    };
    ctx.set_return_value(value as u64);
}

/// Dispatch one system call.
///
/// Handlers run with preemption disabled until they voluntarily yield
/// (blocking reads, sleep, wait).
#[allow(clippy::too_many_arguments)]
pub fn handle_syscall(
    syscall_no: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
    _a7: u64,
    ctx: &mut InterruptContext,
) -> SysResult<i64> {
    let syscall = Syscall::try_from(syscall_no).map_err(|_| SysError::InvalidArgument)?;
    crate::process::with_preemption_disabled(|| match syscall {
        Syscall::Open => filesystem::sys_open(a1, a2, a3, a4 as i64, a5),
        Syscall::Close => filesystem::sys_close(a1 as i64),
        Syscall::Read => filesystem::sys_read(a1 as i64, a2, a3, a4),
        Syscall::Write => filesystem::sys_write(a1 as i64, a2, a3, a4),
        Syscall::Seek => filesystem::sys_seek(a1 as i64, a2, a3 as i64),
        Syscall::Stat => filesystem::sys_stat(a1 as i64, a2, a3, a4 != 0, a5),
        Syscall::GetDirEntries => filesystem::sys_get_directory_entries(a1 as i64, a2, a3, a4),
        Syscall::Duplicate => filesystem::sys_duplicate(a1 as i64, a2 as i64, a3 as u8),
        Syscall::ListDevices => device::sys_list_devices(a1, a2, a3),
        Syscall::OpenDevice => device::sys_open_device(a1, a2),
        Syscall::CommandDevice => device::sys_command_device(a1 as i64, a2, a3, a4),
        Syscall::Allocate => memory::sys_allocate(a1, a2, a3),
        Syscall::Deallocate => memory::sys_deallocate(a1, a2),
        Syscall::CreatePipe => ipc::sys_create_pipe(a1, a2),
        Syscall::GetPid => process::sys_get_pid(),
        Syscall::Fork => process::sys_fork(ctx),
        Syscall::Exec => process::sys_exec(a1, a2, a3, a4, a5, a6, ctx),
        Syscall::Exit => process::sys_exit(a1 as i32),
        Syscall::Wait => process::sys_wait(a1 as i64, a2),
        Syscall::ChangeWorkingDirectory => filesystem::sys_change_working_directory(a1, a2),
        Syscall::InterlinkAdvertise => ipc::sys_interlink_advertise(a1, a2, a3 as u8),
        Syscall::InterlinkConnect => ipc::sys_interlink_connect(a1, a2, a3 as u8),
        Syscall::InterlinkAccept => ipc::sys_interlink_accept(a1 as i64, a2 as u8, a3 != 0),
        Syscall::InterlinkSend => ipc::sys_interlink_send(a1 as i64, a2, a3),
        Syscall::InterlinkReceive => ipc::sys_interlink_receive(a1 as i64, a2, a3),
        Syscall::Sleep => time::sys_sleep(a1),
        Syscall::GetTicks => time::sys_get_ticks(),
    })
}

/// Fetch the entity at `slot` of the calling process.
pub(crate) fn current_handle(slot: i64) -> SysResult<crate::process::entity::EntityRef> {
    crate::process::with_current_process(|process| {
        process
            .userspace
            .as_ref()
            .ok_or(SysError::NotSupported)
            .and_then(|userspace| userspace.get_handle(slot))
    })
    .ok_or(SysError::Failed)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_stable() {
        assert_eq!(Syscall::try_from(0), Ok(Syscall::Open));
        assert_eq!(Syscall::try_from(13), Ok(Syscall::CreatePipe));
        assert_eq!(Syscall::try_from(15), Ok(Syscall::Fork));
        assert_eq!(Syscall::try_from(20), Ok(Syscall::InterlinkAdvertise));
        assert_eq!(Syscall::try_from(26), Ok(Syscall::GetTicks));
        assert!(Syscall::try_from(27).is_err());
    }
}
