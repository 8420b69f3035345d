//! Interrupt controller abstraction and deferred calls.
//!
//! A controller maps platform interrupt specifiers to flat interrupt ids,
//! dispatches handlers, and gates delivery per id. Work an interrupt
//! handler cannot finish inline goes into a small fixed ring of deferred
//! calls executed after IRQ return with interrupts re-enabled.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::{Mutex, Once};

use crate::error::{SysError, SysResult};

/// Handler invoked with interrupts masked; must run to completion.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Abstraction over the platform interrupt controller (GIC-400 shaped).
pub trait InterruptController: Send + Sync {
    /// Translate a controller-specific specifier (for GIC-400: the three
    /// big-endian u32 cells `(is_ppi, id, flags)` of a device tree
    /// `interrupts` entry) into a flat interrupt id.
    fn register_interrupt(&self, selection_bytes: &[u8]) -> SysResult<u32>;

    fn register_handler(&self, id: u32, handler: IrqHandler) -> SysResult<()>;

    fn enable(&self, id: u32);

    fn disable(&self, id: u32);

    /// Service one pending interrupt batch; called from the exception
    /// vector.
    fn handle_interrupt(&self);
}

static GLOBAL_CONTROLLER: Once<Arc<dyn InterruptController>> = Once::new();

/// Install the probed system interrupt controller.
pub fn set_global_controller(controller: Arc<dyn InterruptController>) {
    GLOBAL_CONTROLLER.call_once(|| controller);
}

pub fn global_controller() -> Option<Arc<dyn InterruptController>> {
    GLOBAL_CONTROLLER.get().cloned()
}

/// C-ABI wrapper the exception vector jumps to.
#[no_mangle]
pub extern "C" fn handle_irq_entry() {
    handle_irq();
}

/// Entry point from the exception vector: dispatch, then run the deferred
/// queue with interrupts enabled but preemption inhibited.
pub fn handle_irq() {
    if let Some(controller) = global_controller() {
        controller.handle_interrupt();
    }
    crate::process::with_preemption_disabled(|| {
        crate::arch::enable_interrupts();
        deferred::execute_queue();
        crate::arch::disable_interrupts();
    });
}

pub mod deferred {
    //! Fixed-capacity queue of calls deferred out of interrupt handlers.

    use super::*;

    type DeferredCall = Box<dyn FnOnce() + Send>;

    const QUEUE_CAPACITY: usize = 5;

    static QUEUE: Mutex<[Option<DeferredCall>; QUEUE_CAPACITY]> =
        Mutex::new([None, None, None, None, None]);

    /// Queue `callback` for execution after IRQ return. Fails with
    /// `OutOfMemory` when all slots are taken.
    pub fn queue_call(callback: impl FnOnce() + Send + 'static) -> SysResult<()> {
        let _irq = crate::arch::interrupt_guard();
        let mut queue = QUEUE.lock();
        for slot in queue.iter_mut() {
            if slot.is_none() {
                *slot = Some(Box::new(callback));
                return Ok(());
            }
        }
        Err(SysError::OutOfMemory)
    }

    /// Drain and run every queued call.
    pub fn execute_queue() {
        loop {
            // Take one call at a time so a deferred call may itself queue
            // further work without deadlocking on the queue lock.
            let next = {
                let _irq = crate::arch::interrupt_guard();
                let mut queue = QUEUE.lock();
                let mut taken = None;
                for slot in queue.iter_mut() {
                    if slot.is_some() {
                        taken = slot.take();
                        break;
                    }
                }
                taken
            };
            match next {
                Some(call) => call(),
                None => break,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use core::sync::atomic::{AtomicU32, Ordering};

        // One test only: the queue is a process-wide singleton and the
        // host harness runs tests concurrently.
        #[test]
        fn queue_bounds_reuse_and_requeue() {
            static COUNTER: AtomicU32 = AtomicU32::new(0);
            execute_queue(); // Start from an empty queue.

            for _ in 0..QUEUE_CAPACITY {
                queue_call(|| {
                    COUNTER.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
            assert_eq!(queue_call(|| ()).unwrap_err(), SysError::OutOfMemory);
            execute_queue();
            assert_eq!(COUNTER.load(Ordering::Relaxed), QUEUE_CAPACITY as u32);

            // Slots are reusable, and a deferred call may queue more work
            // which drains in the same pass.
            queue_call(|| {
                COUNTER.fetch_add(1, Ordering::Relaxed);
                queue_call(|| {
                    COUNTER.fetch_add(10, Ordering::Relaxed);
                })
                .unwrap();
            })
            .unwrap();
            execute_queue();
            assert_eq!(COUNTER.load(Ordering::Relaxed), QUEUE_CAPACITY as u32 + 11);
        }
    }
}
