//! Architecture layer.
//!
//! The assembly bodies for exception entry, context switch and MMU root
//! programming live in an external object; this module states their
//! contracts and provides the register-frame types they operate on. Host
//! builds substitute panicking stubs so the rest of the kernel compiles
//! and its logic tests run.

/// Registers pushed to the top of the kernel stack on exception entry.
///
/// Layout is fixed by the exception vectors; do not reorder.
#[repr(C, align(16))]
#[derive(Debug, Clone)]
pub struct InterruptContext {
    /// x0-x30; x30 is the return address.
    pub x: [u64; 31],
    pub sp_el0: u64,
    pub spsr_el1: u64,
    pub elr_el1: u64,
}

impl InterruptContext {
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 31],
            sp_el0: 0,
            spsr_el1: 0,
            elr_el1: 0,
        }
    }

    pub fn set_return_value(&mut self, value: u64) {
        self.x[0] = value;
    }
}

/// SPSR value for an EL0t return with all interrupts unmasked.
pub const SPSR_EL0T: u64 = 0;

/// The callee-saved register set, captured as if across a function call.
/// Used by the context switch and by first entry into a process.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct SavedRegisters {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    /// x29.
    pub fp: u64,
    /// x30; the resume pc.
    pub lr: u64,
    pub sp: u64,
    pub el0_sp: u64,
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
extern "C" {
    /// Swap callee-saved state: saves into `previous`, restores from
    /// `next`. Returns when something later switches back to `previous`.
    /// The caller must have switched the user address space first.
    fn do_context_switch(previous: *mut SavedRegisters, next: *mut SavedRegisters);

    /// Write the TTBR0 root and invalidate stale translations.
    fn do_switch_user_address_space(root: u64);

    /// First-entry trampoline for kernel tasks: calls x19 with x20.
    fn kernel_task_entry_stub();

    /// First-entry trampoline for processes with a fabricated
    /// [`InterruptContext`] at `sp`: pops it and erets to user mode.
    fn restore_context_stub();
}

impl SavedRegisters {
    /// State for a fresh kernel task: on first switch-in the trampoline
    /// calls `task(arg)` on `kernel_stack_top`.
    pub fn create_for_kernel_task(
        task: extern "C" fn(*mut core::ffi::c_void),
        arg: *mut core::ffi::c_void,
        kernel_stack_top: usize,
    ) -> Self {
        Self {
            x19: task as usize as u64,
            x20: arg as u64,
            sp: kernel_stack_top as u64,
            lr: trampoline_addr(TrampolineKind::KernelTask),
            ..Default::default()
        }
    }

    /// State for first entry into a freshly exec'd process: an exception
    /// frame returning to `user_entry` on `user_stack` is fabricated at
    /// the top of the kernel stack.
    pub fn create_for_user_execute(
        user_entry: usize,
        kernel_stack_top: usize,
        user_stack: usize,
        arg0: u64,
    ) -> Self {
        let mut ctx = InterruptContext::zeroed();
        ctx.x[0] = arg0;
        ctx.elr_el1 = user_entry as u64;
        ctx.spsr_el1 = SPSR_EL0T;
        ctx.sp_el0 = user_stack as u64;
        Self::with_pushed_context(ctx, kernel_stack_top)
    }

    /// State for the child side of fork: the parent's interrupt frame with
    /// the syscall return value replaced by 0.
    pub fn create_for_return_from_fork(parent_ctx: &InterruptContext, kernel_stack_top: usize) -> Self {
        let mut ctx = parent_ctx.clone();
        ctx.set_return_value(0);
        Self::with_pushed_context(ctx, kernel_stack_top)
    }

    fn with_pushed_context(ctx: InterruptContext, kernel_stack_top: usize) -> Self {
        let frame_addr = (kernel_stack_top - core::mem::size_of::<InterruptContext>()) & !0xF;
        #[cfg(target_os = "none")]
        // SAFETY: the kernel stack is freshly allocated and exclusively
        // owned by the new process; the frame lies wholly inside it.
        unsafe {
            core::ptr::write(frame_addr as *mut InterruptContext, ctx);
        }
        #[cfg(not(target_os = "none"))]
        let _ = ctx;
        Self {
            sp: frame_addr as u64,
            lr: trampoline_addr(TrampolineKind::RestoreContext),
            el0_sp: 0,
            ..Default::default()
        }
    }
}

enum TrampolineKind {
    KernelTask,
    RestoreContext,
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn trampoline_addr(kind: TrampolineKind) -> u64 {
    match kind {
        TrampolineKind::KernelTask => kernel_task_entry_stub as usize as u64,
        TrampolineKind::RestoreContext => restore_context_stub as usize as u64,
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
fn trampoline_addr(_kind: TrampolineKind) -> u64 {
    0
}

/// Perform the architectural context switch.
///
/// # Safety
///
/// `previous` must be the currently executing context and `next` a valid
/// saved context whose address space is already active.
pub unsafe fn context_switch(previous: &mut SavedRegisters, next: &mut SavedRegisters) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: forwarded contract.
    unsafe {
        do_context_switch(previous, next);
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = (previous, next);
        unimplemented!("context switch on host");
    }
}

/// Install a user address-space root (TTBR0).
pub fn switch_user_address_space(root: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: `root` comes from a live SpaceManager whose tables stay
    // allocated while the process can run.
    unsafe {
        do_switch_user_address_space(root);
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = root;
}

/// Invalidate all EL1&0 TLB entries after unmapping.
pub fn invalidate_tlb_all() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: tlbi vmalle1 + barriers have no memory operands; this only
    // discards cached translations.
    unsafe {
        core::arch::asm!("dsb ishst", "tlbi vmalle1", "dsb ish", "isb", options(nostack));
    }
}

/// Mask IRQs at the current exception level.
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: DAIF manipulation has no memory effects.
    unsafe {
        core::arch::asm!("msr daifset, #2", options(nomem, nostack));
    }
}

/// Unmask IRQs at the current exception level.
pub fn enable_interrupts() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: DAIF manipulation has no memory effects.
    unsafe {
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
    }
}

/// RAII interrupt mask: restores the previous state on drop.
///
/// Data touched by interrupt handlers (the process table, wait queues)
/// is locked under one of these so a tick cannot spin on a lock its
/// interrupted owner holds.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            enable_interrupts();
        }
    }
}

/// Mask IRQs, remembering whether they were enabled.
pub fn interrupt_guard() -> InterruptGuard {
    let was_enabled = interrupts_enabled();
    disable_interrupts();
    InterruptGuard { was_enabled }
}

/// True when IRQs are unmasked.
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        let daif: u64;
        // SAFETY: reading DAIF has no side effects.
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
        }
        daif & (1 << 7) == 0
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    false
}

/// Idle until the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    cortex_a::asm::wfi();
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    core::hint::spin_loop();
}
