//! ARM generic timer driver (EL1 physical timer).
//!
//! Implements the [`TimerDevice`] contract over the `CNTP_*` system
//! registers and a small table of scheduled callbacks. On each timer
//! interrupt every due callback fires; `Reschedule(n)` re-arms it `n`
//! ticks ahead, `Cancel` drops it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::devicetree::{ProbeContext, ProbeResult};
use crate::timer::{CallbackAction, TimerCallback, TimerDevice};

use super::{Device, DeviceKind};

const MAX_CALLBACKS: usize = 8;

/// The non-secure EL1 physical timer interrupt is the second triple of
/// the node's `interrupts` property.
const PHYS_TIMER_SPECIFIER: core::ops::Range<usize> = 12..24;

struct Scheduled {
    deadline: u64,
    callback: TimerCallback,
}

pub struct ArmGenericTimer {
    callbacks: Mutex<Vec<Scheduled>>,
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod counter {
    pub fn frequency() -> u64 {
        let value: u64;
        // SAFETY: CNTFRQ_EL0 read, no side effects.
        unsafe {
            core::arch::asm!("mrs {}, cntfrq_el0", out(reg) value, options(nomem, nostack));
        }
        value
    }

    pub fn count() -> u64 {
        let value: u64;
        // SAFETY: CNTPCT_EL0 read; isb orders it against earlier
        // instructions per the architecture requirement.
        unsafe {
            core::arch::asm!("isb", "mrs {}, cntpct_el0", out(reg) value, options(nomem, nostack));
        }
        value
    }

    pub fn arm(ticks_from_now: u64) {
        // SAFETY: programs the EL1 physical timer compare offset and
        // enables it; register writes only.
        unsafe {
            core::arch::asm!(
                "msr cntp_tval_el0, {tval}",
                "msr cntp_ctl_el0, {ctl}",
                tval = in(reg) ticks_from_now,
                ctl = in(reg) 1u64,
                options(nomem, nostack)
            );
        }
    }

    pub fn disarm() {
        // SAFETY: disables the EL1 physical timer; register write only.
        unsafe {
            core::arch::asm!("msr cntp_ctl_el0, xzr", options(nomem, nostack));
        }
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
mod counter {
    //! Host substitute: a test-settable counter at a fixed frequency.
    use core::sync::atomic::{AtomicU64, Ordering};

    pub static TEST_TICKS: AtomicU64 = AtomicU64::new(0);

    pub fn frequency() -> u64 {
        62_500_000
    }

    pub fn count() -> u64 {
        TEST_TICKS.load(Ordering::Relaxed)
    }

    pub fn arm(_ticks_from_now: u64) {}

    pub fn disarm() {}
}

impl ArmGenericTimer {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Fire every due callback and re-arm the hardware comparator for the
    /// next deadline. Called from the timer interrupt handler.
    pub fn handle_irq(&self) {
        let now = counter::count();
        let mut due = Vec::new();
        {
            let mut callbacks = self.callbacks.lock();
            let mut index = 0;
            while index < callbacks.len() {
                if callbacks[index].deadline <= now {
                    due.push(callbacks.swap_remove(index));
                } else {
                    index += 1;
                }
            }
        }
        for mut entry in due {
            match (entry.callback)() {
                CallbackAction::Cancel => {}
                CallbackAction::Reschedule(ticks) => {
                    entry.deadline = now.wrapping_add(ticks.max(0) as u64);
                    self.callbacks.lock().push(entry);
                }
            }
        }
        self.arm_next();
    }

    fn arm_next(&self) {
        let callbacks = self.callbacks.lock();
        match callbacks.iter().map(|s| s.deadline).min() {
            Some(deadline) => {
                let now = counter::count();
                counter::arm(deadline.saturating_sub(now).max(1));
            }
            None => counter::disarm(),
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.callbacks.lock().len()
    }
}

impl Default for ArmGenericTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for ArmGenericTimer {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Timer
    }

    fn preferred_name_prefix(&self) -> &'static str {
        "generic.timer"
    }
}

impl TimerDevice for ArmGenericTimer {
    fn get_frequency(&self) -> u64 {
        counter::frequency()
    }

    fn get_ticks(&self) -> u64 {
        counter::count()
    }

    fn schedule_callback(&self, callback: TimerCallback, ticks_from_now: i64) -> bool {
        {
            let mut callbacks = self.callbacks.lock();
            if callbacks.len() >= MAX_CALLBACKS {
                return false;
            }
            callbacks.push(Scheduled {
                deadline: counter::count().wrapping_add(ticks_from_now.max(0) as u64),
                callback,
            });
        }
        self.arm_next();
        true
    }
}

/// Probe for the ARM architected timer node.
pub fn probe(ctx: &ProbeContext, node: usize) -> ProbeResult {
    if !ctx.tree.is_compatible(node, "arm,armv8-timer")
        && !ctx.tree.is_compatible(node, "arm,armv7-timer")
    {
        return ProbeResult::Unrecognised;
    }
    let Some(controller) = crate::irq::global_controller() else {
        return ProbeResult::Waiting;
    };
    let Some(specifier) = ctx
        .tree
        .interrupts(node)
        .and_then(|cells| cells.get(PHYS_TIMER_SPECIFIER))
    else {
        return ProbeResult::Failure;
    };
    let Ok(id) = controller.register_interrupt(specifier) else {
        return ProbeResult::Failure;
    };

    let timer = Arc::new(ArmGenericTimer::new());
    let for_irq = timer.clone();
    if controller
        .register_handler(id, alloc::boxed::Box::new(move || for_irq.handle_irq()))
        .is_err()
    {
        return ProbeResult::Failure;
    }
    controller.enable(id);

    if crate::timer::initialise(timer.clone()).is_err() {
        return ProbeResult::Failure;
    }
    super::with_registry(|registry| registry.register_device(timer));
    ProbeResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn callbacks_fire_reschedule_and_cancel() {
        let timer = ArmGenericTimer::new();
        counter::TEST_TICKS.store(1000, Ordering::Relaxed);

        static FIRED: AtomicU64 = AtomicU64::new(0);
        FIRED.store(0, Ordering::Relaxed);

        // One-shot at +100, periodic every 50.
        assert!(timer.schedule_callback(
            alloc::boxed::Box::new(|| {
                FIRED.fetch_add(1, Ordering::Relaxed);
                CallbackAction::Cancel
            }),
            100
        ));
        assert!(timer.schedule_callback(
            alloc::boxed::Box::new(|| {
                FIRED.fetch_add(100, Ordering::Relaxed);
                CallbackAction::Reschedule(50)
            }),
            50
        ));
        assert_eq!(timer.pending(), 2);

        // Nothing due yet.
        counter::TEST_TICKS.store(1049, Ordering::Relaxed);
        timer.handle_irq();
        assert_eq!(FIRED.load(Ordering::Relaxed), 0);

        // The periodic callback fires and re-arms.
        counter::TEST_TICKS.store(1050, Ordering::Relaxed);
        timer.handle_irq();
        assert_eq!(FIRED.load(Ordering::Relaxed), 100);
        assert_eq!(timer.pending(), 2);

        // Both due; the one-shot disappears afterwards.
        counter::TEST_TICKS.store(1150, Ordering::Relaxed);
        timer.handle_irq();
        assert_eq!(FIRED.load(Ordering::Relaxed), 201);
        assert_eq!(timer.pending(), 1);
    }

    #[test]
    fn callback_table_is_bounded() {
        let timer = ArmGenericTimer::new();
        for _ in 0..MAX_CALLBACKS {
            assert!(timer
                .schedule_callback(alloc::boxed::Box::new(|| CallbackAction::Cancel), 1_000_000));
        }
        assert!(!timer
            .schedule_callback(alloc::boxed::Box::new(|| CallbackAction::Cancel), 1_000_000));
    }
}
