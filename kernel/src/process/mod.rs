//! Processes, the process table, and the scheduler.
//!
//! Single CPU, cooperative with timer-driven preemption. The boot path
//! adopts the current call stack as the first process (`ktask`);
//! userspace processes carry their own space manager, working directory
//! and entity table. Scheduling is round-robin over `Running` processes
//! and is inhibited while the preemption counter is raised.

pub mod entity;
pub mod pipe;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicI32, Ordering};

use spin::Mutex;

use crate::arch::{self, InterruptContext, SavedRegisters};
use crate::error::{SysError, SysResult};
use crate::fs::EntryRef;
use crate::mm::{SpaceManager, UserOwnedAllocation, VirtualRegion};

use entity::{EntityRef, LocalEntityHandle};

/// Kernel stack size for every process (16 KiB).
pub const KERNEL_STACK_PAGES: usize = 4;

/// Scheduler quantum in timer callbacks.
const QUANTUM_TICKS: i64 = 5;

/// Scheduler tick period.
const TICK_NANOSECONDS: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Being constructed; not yet schedulable.
    Unready,
    /// Deliberately stopped.
    Stopped,
    /// Runnable (or running right now).
    Running,
    /// Parked until an event wakes it.
    Waiting,
    /// Exited; waiting for the parent to reap it.
    AwaitingDeath,
}

/// Userspace half of a process; kernel tasks have none.
pub struct UserspaceState {
    pub user_stack_top: usize,
    pub cwd: EntryRef,
    pub space_manager: SpaceManager,
    /// Sparse descriptor table indexed by the user-visible fd.
    pub open_entities: Vec<Option<LocalEntityHandle>>,
}

impl UserspaceState {
    pub fn get_handle(&self, slot: i64) -> SysResult<EntityRef> {
        usize::try_from(slot)
            .ok()
            .and_then(|index| self.open_entities.get(index))
            .and_then(|slot| slot.as_ref())
            .map(|local| local.handle.clone())
            .ok_or(SysError::BadHandle)
    }

    /// Place `handle` in the lowest free slot.
    pub fn allocate_handle_slot(&mut self, handle: EntityRef, group: u8) -> i64 {
        let local = LocalEntityHandle { handle, group };
        for (index, slot) in self.open_entities.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(local);
                return index as i64;
            }
        }
        self.open_entities.push(Some(local));
        (self.open_entities.len() - 1) as i64
    }

    /// Place `handle` at `slot` exactly, closing whatever was there.
    pub fn set_handle_slot(
        &mut self,
        slot: i64,
        handle: EntityRef,
        group: u8,
    ) -> SysResult<i64> {
        let index = usize::try_from(slot).map_err(|_| SysError::BadHandle)?;
        if index >= self.open_entities.len() {
            self.open_entities.resize_with(index + 1, || None);
        }
        self.open_entities[index] = Some(LocalEntityHandle { handle, group });
        Ok(slot)
    }

    pub fn close_handle_slot(&mut self, slot: i64) -> SysResult<()> {
        let index = usize::try_from(slot).map_err(|_| SysError::BadHandle)?;
        match self.open_entities.get_mut(index) {
            Some(entry @ Some(_)) => {
                *entry = None;
                Ok(())
            }
            _ => Err(SysError::BadHandle),
        }
    }
}

pub struct Process {
    pub name: String,
    pub pid: i64,
    pub parent: Option<i64>,
    pub children: Vec<i64>,
    pub saved_registers: SavedRegisters,
    pub kernel_stack: VirtualRegion,
    /// Owns the kernel stack pages; `None` for the adopted boot stack.
    #[allow(dead_code)]
    stack_backing: Option<UserOwnedAllocation>,
    pub userspace: Option<UserspaceState>,
    pub state: ProcessState,
    pub processor_time_counter: i64,
    pub exit_code: Option<i32>,
}

type ProcessCell = Arc<Mutex<Process>>;

struct ProcessManager {
    processes: Vec<ProcessCell>,
    current: ProcessCell,
    next_pid: i64,
    /// Orphans are re-parented here (the first user process).
    init_pid: Option<i64>,
    last_nanoseconds: u64,
}

static MANAGER: Mutex<Option<ProcessManager>> = Mutex::new(None);

/// Non-zero while preemption is inhibited.
static PREEMPT_COUNTER: AtomicI32 = AtomicI32::new(0);

pub fn enter_critical() {
    PREEMPT_COUNTER.fetch_add(1, Ordering::Acquire);
}

pub fn exit_critical() {
    let previous = PREEMPT_COUNTER.fetch_sub(1, Ordering::Release);
    debug_assert!(previous > 0, "unbalanced exit_critical");
}

pub fn is_critical() -> bool {
    PREEMPT_COUNTER.load(Ordering::Acquire) > 0
}

/// Run `f` with preemption inhibited.
pub fn with_preemption_disabled<R>(f: impl FnOnce() -> R) -> R {
    enter_critical();
    let result = f();
    exit_critical();
    result
}

/// Adopt the running boot stack as the first process.
pub fn initialise_and_adopt(name: &str, kernel_stack: VirtualRegion) -> SysResult<()> {
    let _irq = arch::interrupt_guard();
    let mut manager = MANAGER.lock();
    if manager.is_some() {
        return Err(SysError::Exists);
    }
    let ktask = Arc::new(Mutex::new(Process {
        name: String::from(name),
        pid: 0,
        parent: None,
        children: Vec::new(),
        saved_registers: SavedRegisters::default(),
        kernel_stack,
        stack_backing: None,
        userspace: None,
        state: ProcessState::Running,
        processor_time_counter: QUANTUM_TICKS,
        exit_code: None,
    }));
    *manager = Some(ProcessManager {
        processes: alloc::vec![ktask.clone()],
        current: ktask,
        next_pid: 1,
        init_pid: None,
        last_nanoseconds: 0,
    });
    Ok(())
}

/// Arm the scheduler tick. Called once the system timer is up.
pub fn initialise_scheduling() -> SysResult<()> {
    crate::timer::schedule_callback(
        |_now| {
            on_timer_tick();
            crate::timer::CallbackAction::Reschedule(
                crate::timer::system_ticks_for_nanoseconds(TICK_NANOSECONDS) as i64,
            )
        },
        TICK_NANOSECONDS,
    )
}

fn on_timer_tick() {
    // Interrupt context: never spin on a lock the interrupted code may
    // hold; a skipped tick just delays preemption by one period.
    let expired = {
        let Some(mut manager_guard) = MANAGER.try_lock() else {
            return;
        };
        let Some(manager) = manager_guard.as_mut() else {
            return;
        };
        manager.last_nanoseconds = crate::timer::nanoseconds_since_start();
        let Some(mut current) = manager.current.try_lock() else {
            return;
        };
        current.processor_time_counter -= 1;
        if current.processor_time_counter <= 0 {
            current.processor_time_counter = QUANTUM_TICKS;
            true
        } else {
            false
        }
    };
    if expired {
        schedule();
    }
}

fn register_process(manager: &mut ProcessManager, mut process: Process) -> ProcessCell {
    process.pid = manager.next_pid;
    manager.next_pid += 1;
    let cell = Arc::new(Mutex::new(process));
    manager.processes.push(cell.clone());
    cell
}

/// Pick the next runnable process (round-robin) and switch to it.
///
/// Returns false when scheduling is inhibited or there is nothing else to
/// run.
pub fn schedule() -> bool {
    if is_critical() {
        return false;
    }
    let (previous_ptr, next_ptr, next_root) = {
        let _irq = arch::interrupt_guard();
        let mut manager_guard = MANAGER.lock();
        let Some(manager) = manager_guard.as_mut() else {
            return false;
        };

        let current_index = manager
            .processes
            .iter()
            .position(|p| Arc::ptr_eq(p, &manager.current))
            .unwrap_or(0);
        let count = manager.processes.len();
        let mut next = None;
        for step in 1..=count {
            let candidate = &manager.processes[(current_index + step) % count];
            if Arc::ptr_eq(candidate, &manager.current) {
                continue;
            }
            if candidate.lock().state == ProcessState::Running {
                next = Some(candidate.clone());
                break;
            }
        }
        let Some(next) = next else {
            return false;
        };

        let previous = manager.current.clone();
        manager.current = next.clone();

        // Pointers into the cells stay valid: the Arcs keep the
        // allocations alive and nothing moves a Process once registered.
        let previous_ptr = {
            let mut guard = previous.lock();
            &mut guard.saved_registers as *mut SavedRegisters
        };
        let (next_ptr, next_root) = {
            let mut guard = next.lock();
            let root = guard
                .userspace
                .as_ref()
                .map(|u| u.space_manager.raw_root_ptr())
                .unwrap_or(0);
            (&mut guard.saved_registers as *mut SavedRegisters, root)
        };
        (previous_ptr, next_ptr, next_root)
    };

    // Switch the user address space before the register state.
    if next_root != 0 {
        arch::switch_user_address_space(next_root);
    }
    // SAFETY: previous is the executing context, next is a valid saved
    // context whose address space was just installed; single CPU, so no
    // other thread touches either SavedRegisters while we switch.
    unsafe {
        arch::context_switch(&mut *previous_ptr, &mut *next_ptr);
    }
    true
}

fn current_cell() -> Option<ProcessCell> {
    let _irq = arch::interrupt_guard();
    MANAGER.lock().as_ref().map(|m| m.current.clone())
}

/// Run `f` on the current process.
pub fn with_current_process<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let cell = current_cell()?;
    let _irq = arch::interrupt_guard();
    let mut guard = cell.lock();
    Some(f(&mut guard))
}

/// Run `f` on the current process's space manager (None for kernel
/// tasks).
pub fn with_current_space_manager<R>(f: impl FnOnce(&mut SpaceManager) -> R) -> Option<R> {
    let cell = current_cell()?;
    let _irq = arch::interrupt_guard();
    let mut guard = cell.lock();
    guard
        .userspace
        .as_mut()
        .map(|userspace| f(&mut userspace.space_manager))
}

pub fn current_pid() -> Option<i64> {
    with_current_process(|p| p.pid)
}

/// Park the current process until [`wake`] is called on its pid.
///
/// This is the voluntary yield point of a blocking syscall: the
/// handler's preemption inhibition is dropped for the duration of the
/// park and restored before returning to the handler.
pub fn block_current() {
    let Some(cell) = current_cell() else {
        core::hint::spin_loop();
        return;
    };
    {
        let _irq = arch::interrupt_guard();
        cell.lock().state = ProcessState::Waiting;
    }
    let inhibition = PREEMPT_COUNTER.swap(0, Ordering::Acquire);
    loop {
        schedule();
        {
            let _irq = arch::interrupt_guard();
            if cell.lock().state == ProcessState::Running {
                break;
            }
        }
        // Nothing else runnable; wait for the interrupt that wakes us.
        core::hint::spin_loop();
    }
    PREEMPT_COUNTER.store(inhibition, Ordering::Release);
}

/// Make `pid` runnable again.
pub fn wake(pid: i64) {
    let _irq = arch::interrupt_guard();
    let manager = MANAGER.lock();
    let Some(manager) = manager.as_ref() else {
        return;
    };
    for cell in &manager.processes {
        let mut process = cell.lock();
        if process.pid == pid && process.state == ProcessState::Waiting {
            process.state = ProcessState::Running;
            return;
        }
    }
}

/// A list of parked processes tied to some condition.
pub struct WaitQueue {
    waiters: Mutex<Vec<i64>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Park the calling process until the next [`wake_all`](Self::wake_all).
    pub fn park_current(&self) {
        let Some(pid) = current_pid() else {
            core::hint::spin_loop();
            return;
        };
        self.waiters.lock().push(pid);
        block_current();
    }

    pub fn wake_all(&self) {
        let woken: Vec<i64> = core::mem::take(&mut *self.waiters.lock());
        for pid in woken {
            wake(pid);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn allocate_kernel_stack() -> SysResult<(VirtualRegion, UserOwnedAllocation)> {
    let backing = UserOwnedAllocation::create_contiguous(KERNEL_STACK_PAGES)?;
    let region = backing.kernel_region();
    Ok((region, backing))
}

/// Spawn a pure kernel task.
pub fn spawn_kernel_process(
    name: &str,
    task: extern "C" fn(*mut core::ffi::c_void),
    arg: *mut core::ffi::c_void,
) -> SysResult<i64> {
    let (stack, backing) = allocate_kernel_stack()?;
    let saved = SavedRegisters::create_for_kernel_task(task, arg, stack.end().get());
    let _irq = arch::interrupt_guard();
    let mut manager_guard = MANAGER.lock();
    let manager = manager_guard.as_mut().ok_or(SysError::Failed)?;
    let cell = register_process(
        manager,
        Process {
            name: String::from(name),
            pid: 0,
            parent: None,
            children: Vec::new(),
            saved_registers: saved,
            kernel_stack: stack,
            stack_backing: Some(backing),
            userspace: None,
            state: ProcessState::Running,
            processor_time_counter: QUANTUM_TICKS,
            exit_code: None,
        },
    );
    let pid = cell.lock().pid;
    Ok(pid)
}

/// Spawn the first user process from an executable entry.
pub fn spawn_user_process(name: &str, executable: EntryRef, cwd: EntryRef) -> SysResult<i64> {
    let mut space_manager = SpaceManager::create()?;
    let image = crate::elf::load_executable(&executable, &mut space_manager)?;
    let stack_top = crate::elf::build_user_stack(&mut space_manager, &[], &[])?;

    let (stack, backing) = allocate_kernel_stack()?;
    let saved = SavedRegisters::create_for_user_execute(
        image.entry_point,
        stack.end().get(),
        stack_top.stack_pointer,
        stack_top.arg0,
    );

    let _irq = arch::interrupt_guard();
    let mut manager_guard = MANAGER.lock();
    let manager = manager_guard.as_mut().ok_or(SysError::Failed)?;
    let cell = register_process(
        manager,
        Process {
            name: String::from(name),
            pid: 0,
            parent: None,
            children: Vec::new(),
            saved_registers: saved,
            kernel_stack: stack,
            stack_backing: Some(backing),
            userspace: Some(UserspaceState {
                user_stack_top: stack_top.stack_pointer,
                cwd,
                space_manager,
                open_entities: Vec::new(),
            }),
            state: ProcessState::Running,
            processor_time_counter: QUANTUM_TICKS,
            exit_code: None,
        },
    );
    let pid = cell.lock().pid;
    if manager.init_pid.is_none() {
        manager.init_pid = Some(pid);
    }
    Ok(pid)
}

/// Fork the current process. The child's first schedule resumes from the
/// caller's interrupt frame with a zero return value; the parent receives
/// the child pid.
pub fn fork_current(ctx: &InterruptContext) -> SysResult<i64> {
    let parent_cell = current_cell().ok_or(SysError::Failed)?;

    let (name, parent_pid, cloned_userspace) = {
        let _irq = arch::interrupt_guard();
        let parent = parent_cell.lock();
        let userspace = parent.userspace.as_ref().ok_or(SysError::NotSupported)?;
        let space_manager = userspace.space_manager.clone_for_fork()?;
        let open_entities = userspace.open_entities.clone();
        (
            parent.name.clone(),
            parent.pid,
            UserspaceState {
                user_stack_top: userspace.user_stack_top,
                cwd: userspace.cwd.clone(),
                space_manager,
                open_entities,
            },
        )
    };

    let (stack, backing) = allocate_kernel_stack()?;
    let saved = SavedRegisters::create_for_return_from_fork(ctx, stack.end().get());

    let _irq = arch::interrupt_guard();
    let mut manager_guard = MANAGER.lock();
    let manager = manager_guard.as_mut().ok_or(SysError::Failed)?;
    let cell = register_process(
        manager,
        Process {
            name,
            pid: 0,
            parent: Some(parent_pid),
            children: Vec::new(),
            saved_registers: saved,
            kernel_stack: stack,
            stack_backing: Some(backing),
            userspace: Some(cloned_userspace),
            state: ProcessState::Running,
            processor_time_counter: QUANTUM_TICKS,
            exit_code: None,
        },
    );
    let child_pid = cell.lock().pid;
    drop(manager_guard);

    parent_cell.lock().children.push(child_pid);
    drop(_irq);
    Ok(child_pid)
}

/// Terminate the current process; never returns.
pub fn quit_current(exit_code: i32) -> ! {
    let parent_to_wake = {
        let _irq = arch::interrupt_guard();
        let mut manager_guard = MANAGER.lock();
        let manager = manager_guard.as_mut().expect("process manager up");
        let init_pid = manager.init_pid.unwrap_or(0);
        let current = manager.current.clone();
        let mut process = current.lock();
        process.state = ProcessState::AwaitingDeath;
        process.exit_code = Some(exit_code);
        let orphans = core::mem::take(&mut process.children);
        let parent = process.parent;
        drop(process);

        // Orphans go to init.
        for cell in &manager.processes {
            let mut candidate = cell.lock();
            if orphans.contains(&candidate.pid) {
                candidate.parent = Some(init_pid);
            }
            if candidate.pid == init_pid {
                candidate.children.extend(orphans.iter().copied());
            }
        }
        parent
    };
    if let Some(parent) = parent_to_wake {
        wake(parent);
    }
    loop {
        schedule();
        core::hint::spin_loop();
    }
}

/// Reap `child_pid`, blocking until it exits. Returns `(pid, exit_code)`.
pub fn wait_for_child(child_pid: i64) -> SysResult<(i64, i32)> {
    loop {
        let reaped = {
            let _irq = arch::interrupt_guard();
            let mut manager_guard = MANAGER.lock();
            let manager = manager_guard.as_mut().ok_or(SysError::Failed)?;
            let current_pid = manager.current.lock().pid;

            let mut found_child = false;
            let mut result = None;
            for (index, cell) in manager.processes.iter().enumerate() {
                let process = cell.lock();
                if process.pid == child_pid && process.parent == Some(current_pid) {
                    found_child = true;
                    if process.state == ProcessState::AwaitingDeath {
                        result = Some((index, process.exit_code.unwrap_or(0)));
                    }
                    break;
                }
            }
            if !found_child {
                return Err(SysError::NoChild);
            }
            if let Some((index, code)) = result {
                manager.processes.remove(index);
                let current = manager.current.clone();
                current.lock().children.retain(|&pid| pid != child_pid);
                Some(code)
            } else {
                None
            }
        };
        match reaped {
            Some(code) => return Ok((child_pid, code)),
            None => block_current(),
        }
    }
}

/// Park the current process for at least `microseconds`.
pub fn sleep_current(microseconds: u64) -> SysResult<()> {
    let Some(pid) = current_pid() else {
        crate::timer::spin_delay_us(microseconds);
        return Ok(());
    };
    crate::timer::schedule_callback(
        move |_now| {
            wake(pid);
            crate::timer::CallbackAction::Cancel
        },
        microseconds * 1000,
    )?;
    block_current();
    Ok(())
}
