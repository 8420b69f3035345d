//! Bare-metal test harness.
//!
//! On `target_os = "none"` the custom test framework collects `#[test_case]`
//! functions and runs them through [`test_runner`], exiting QEMU with a
//! status code via semihosting. On the host target the standard `#[test]`
//! harness is used instead and this module only supplies the shared types.

#![allow(dead_code)]

/// QEMU exit codes understood by the semihosting exit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Terminate QEMU with the given exit code.
///
/// Uses the AArch64 semihosting `SYS_EXIT` call, which the QEMU virt
/// machine honours when started with `-semihosting`. On other targets it
/// parks the core.
pub fn exit_qemu(code: QemuExitCode) -> ! {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        const SYS_EXIT: u64 = 0x18;
        const ADP_STOPPED_APPLICATION_EXIT: u64 = 0x20026;
        let block: [u64; 2] = [ADP_STOPPED_APPLICATION_EXIT, code as u64];
        // SAFETY: hlt #0xf000 is the AArch64 semihosting trap. w0 selects
        // the operation, x1 points to the parameter block, which lives on
        // the current stack for the duration of the call.
        unsafe {
            core::arch::asm!(
                "hlt #0xf000",
                in("w0") SYS_EXIT as u32,
                in("x1") block.as_ptr(),
                options(nostack)
            );
        }
    }
    let _ = code;
    loop {
        core::hint::spin_loop();
    }
}

/// Trait implemented by every test function so the runner can print its
/// name before invoking it.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        println!("{}...", core::any::type_name::<T>());
        self();
        println!("[ok]");
    }
}

/// Custom test runner for bare-metal test binaries.
pub fn test_runner(tests: &[&dyn Testable]) {
    println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// Panic handler used by bare-metal test binaries.
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    println!("[failed]");
    println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed)
}
