//! Completion flag with release/acquire semantics.

use core::sync::atomic::{AtomicBool, Ordering};

/// A one-bit rendezvous between a waiter and a completer.
///
/// The completer (typically an interrupt handler finishing a device
/// transfer) calls [`set`](CompletionFlag::set); the waiter spins in
/// [`wait`](CompletionFlag::wait). The release-store/acquire-load pairing
/// guarantees that everything written before `set` is visible to the
/// waiter after `wait` returns.
#[derive(Debug, Default)]
pub struct CompletionFlag {
    flag: AtomicBool,
}

impl CompletionFlag {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Mark complete.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Re-arm for another round.
    pub fn unset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Observe without waiting.
    pub fn test(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Spin until complete.
    pub fn wait(&self) {
        while !self.test() {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_test() {
        let flag = CompletionFlag::new();
        assert!(!flag.test());
        flag.set();
        assert!(flag.test());
        flag.wait();
        flag.unset();
        assert!(!flag.test());
    }
}
