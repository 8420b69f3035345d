//! bekOS kernel binary.
//!
//! The assembly boot stub brings the MMU up with the kernel linear map,
//! points the exception vectors at the kernel, switches to the boot stack
//! and jumps here with the physical address of the flattened device tree
//! in x0.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use bekos_kernel::mm::{VirtualAddress, VirtualRegion};
    use bekos_kernel::{bootstrap, println};

    extern "C" {
        // Linker-script symbols delimiting the early heap and boot stack.
        static __early_heap_start: u8;
        static __early_heap_end: u8;
        static __boot_stack_bottom: u8;
        static __boot_stack_top: u8;
    }

    fn linker_region(start: &'static u8, end: &'static u8) -> VirtualRegion {
        let start = start as *const u8 as usize;
        let end = end as *const u8 as usize;
        VirtualRegion::new(VirtualAddress::new(start), end - start)
    }

    #[no_mangle]
    pub extern "C" fn kernel_main(dtb_phys: u64) -> ! {
        // SAFETY: the linker script places these symbols around the early
        // heap region, which nothing else touches; called exactly once.
        unsafe {
            bekos_kernel::mm::heap::init(linker_region(&__early_heap_start, &__early_heap_end));
        }

        println!("bekOS kernel {}", env!("CARGO_PKG_VERSION"));

        // SAFETY: boot stack symbols bound the stack we are running on.
        let boot_stack =
            unsafe { linker_region(&__boot_stack_bottom, &__boot_stack_top) };

        let environment = bootstrap::parse_boot_environment(dtb_phys);
        if let Err(error) = bootstrap::kernel_init(environment, boot_stack) {
            panic!("kernel initialisation failed: {}", error);
        }

        // The boot task becomes the idle loop.
        loop {
            bekos_kernel::process::schedule();
            bekos_kernel::arch::wait_for_interrupt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        bekos_kernel::arch::disable_interrupts();
        println!("[KERNEL PANIC] {}", info);
        loop {
            bekos_kernel::arch::wait_for_interrupt();
        }
    }
}

/// The kernel does not run on a hosted target; tests live in the library
/// crate.
#[cfg(not(target_os = "none"))]
fn main() {}
