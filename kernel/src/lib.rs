//! bekOS Kernel Library
//!
//! Core of the bekOS kernel for 64-bit ARM boards (Raspberry Pi class,
//! QEMU virt). This library exports every subsystem so the integration
//! binary and the test harness can reach them.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
// Custom test runner only for bare-metal; host target uses the standard
// #[test] harness.
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// On bare metal the kernel heap is a linked-list allocator over a fixed
// early region handed over by the boot path. On the host target (unit
// tests, coverage) the system allocator is used so test code can allocate
// normally.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the kernel heap allocator.
#[cfg(target_os = "none")]
pub fn heap_allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod blockdev;
pub mod bootstrap;
pub mod buffer;
pub mod devicetree;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod interlink;
pub mod irq;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod utils;

mod test_framework;

pub use test_framework::{exit_qemu, QemuExitCode, Testable};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation error handler.
///
/// Panic is intentional: heap allocation failure in a no_std kernel is
/// unrecoverable. The alloc_error_handler ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("Allocation error: {:?}", layout);
}
