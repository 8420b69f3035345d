//! Time syscalls: Sleep / GetTicks.

use crate::error::SysResult;

pub fn sys_sleep(microseconds: u64) -> SysResult<i64> {
    crate::process::sleep_current(microseconds)?;
    Ok(0)
}

pub fn sys_get_ticks() -> SysResult<i64> {
    Ok(crate::timer::ticks_since_start() as i64)
}
