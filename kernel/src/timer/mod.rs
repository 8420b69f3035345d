//! System timing facility.
//!
//! The platform timer (the ARM generic timer on every supported board)
//! exposes a frequency, a monotonic tick counter and one-shot callbacks;
//! this module layers the kernel-wide nanosecond clock and nanosecond
//! callback API over it. The scheduler tick and the boot-time mount retry
//! delay both run through here.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Once;

use crate::drivers::Device;
use crate::error::{SysError, SysResult};

/// What a fired timer callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Remove the callback.
    Cancel,
    /// Re-arm this many ticks in the future.
    Reschedule(i64),
}

/// Timer callbacks run in interrupt context.
pub type TimerCallback = Box<dyn FnMut() -> CallbackAction + Send>;

/// Contract of the platform timer device.
pub trait TimerDevice: Device {
    /// Tick frequency in Hz.
    fn get_frequency(&self) -> u64;

    /// Monotonic tick counter.
    fn get_ticks(&self) -> u64;

    /// Arm `callback` to fire `ticks_from_now` ticks in the future.
    /// Returns false when the callback table is full.
    fn schedule_callback(&self, callback: TimerCallback, ticks_from_now: i64) -> bool;
}

pub const fn nanoseconds_from_frequency(hertz: u64) -> u64 {
    1_000_000_000 / hertz
}

static SYSTEM_TIMER: Once<Arc<dyn TimerDevice>> = Once::new();

/// Adopt the probed platform timer as the system clock.
pub fn initialise(timer: Arc<dyn TimerDevice>) -> SysResult<()> {
    let mut installed = false;
    SYSTEM_TIMER.call_once(|| {
        installed = true;
        timer
    });
    if installed {
        Ok(())
    } else {
        Err(SysError::Exists)
    }
}

fn system_timer() -> SysResult<&'static Arc<dyn TimerDevice>> {
    SYSTEM_TIMER.get().ok_or(SysError::NoSuchDevice)
}

fn ticks_to_nanoseconds(ticks: u64, frequency: u64) -> u64 {
    (ticks as u128 * 1_000_000_000 / frequency as u128) as u64
}

fn nanoseconds_to_ticks(nanoseconds: u64, frequency: u64) -> u64 {
    (nanoseconds as u128 * frequency as u128 / 1_000_000_000) as u64
}

/// Monotonic nanoseconds since the counter started (at or before boot).
pub fn nanoseconds_since_start() -> u64 {
    match system_timer() {
        Ok(timer) => ticks_to_nanoseconds(timer.get_ticks(), timer.get_frequency()),
        Err(_) => 0,
    }
}

/// Raw tick counter, surfaced by the `GetTicks` syscall.
pub fn ticks_since_start() -> u64 {
    system_timer().map(|t| t.get_ticks()).unwrap_or(0)
}

/// Arm `action` to fire after `nanoseconds`. The action receives the
/// current nanosecond clock and may reschedule itself.
pub fn schedule_callback(
    mut action: impl FnMut(u64) -> CallbackAction + Send + 'static,
    nanoseconds: u64,
) -> SysResult<()> {
    let timer = system_timer()?;
    let frequency = timer.get_frequency();
    let ticks = nanoseconds_to_ticks(nanoseconds, frequency).max(1);
    let wrapped = move || {
        let now = nanoseconds_since_start();
        action(now)
    };
    if timer.schedule_callback(Box::new(wrapped), ticks as i64) {
        Ok(())
    } else {
        Err(SysError::OutOfMemory)
    }
}

/// Convert nanoseconds to system-timer ticks (for `Reschedule`).
pub fn system_ticks_for_nanoseconds(nanoseconds: u64) -> u64 {
    match system_timer() {
        Ok(timer) => nanoseconds_to_ticks(nanoseconds, timer.get_frequency()).max(1),
        Err(_) => 1,
    }
}

/// Busy-wait for `microseconds` against the tick counter.
pub fn spin_delay_us(microseconds: u64) {
    let Ok(timer) = system_timer() else {
        return;
    };
    let frequency = timer.get_frequency();
    let target = timer
        .get_ticks()
        .wrapping_add(nanoseconds_to_ticks(microseconds * 1000, frequency));
    while timer.get_ticks() < target {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversions() {
        // 62.5 MHz: 16 ns per tick.
        assert_eq!(nanoseconds_from_frequency(62_500_000), 16);
        assert_eq!(ticks_to_nanoseconds(62_500_000, 62_500_000), 1_000_000_000);
        assert_eq!(nanoseconds_to_ticks(1_000_000_000, 62_500_000), 62_500_000);
        // Round-trips stay exact for whole-tick quantities.
        for ticks in [1u64, 7, 1000, 123_456_789] {
            let ns = ticks_to_nanoseconds(ticks, 62_500_000);
            assert_eq!(nanoseconds_to_ticks(ns, 62_500_000), ticks);
        }
    }

    #[test]
    fn conversion_does_not_overflow_u64_midpoint() {
        // A century of 1 GHz ticks.
        let ticks = 3_155_760_000_000_000_000u64;
        let ns = ticks_to_nanoseconds(ticks, 1_000_000_000);
        assert_eq!(ns, ticks);
    }
}
