//! Boot sequencing.
//!
//! Brings the subsystems up leaves-first: logging, physical memory,
//! device probing (which yields the interrupt controller, timer, console
//! and block transports), the process manager and scheduler tick, the
//! root filesystem (with retries while devices settle), and finally the
//! first user process.

use alloc::vec::Vec;

use crate::devicetree::{DeviceTree, ProbeContext, ProbeResult};
use crate::error::{SysError, SysResult};
use crate::mm::{
    process_memory_regions, PhysicalRegion, RegionKind, VirtualRegion, PAGE_ALLOCATOR,
};

/// Everything the boot shim hands over after parsing the DTB.
pub struct BootEnvironment {
    pub device_tree: DeviceTree,
    /// Physical footprint of the kernel image.
    pub kernel_image: PhysicalRegion,
    /// Physical footprint of the device tree blob.
    pub dtb_region: PhysicalRegion,
}

extern "Rust" {
    /// Provided by the boot shim: parse the flattened device tree at
    /// `dtb_phys` (via the linear map) into the kernel's tree model and
    /// report the kernel/DTB physical footprints. The kernel heap is live
    /// when this is called.
    fn bekos_parse_dtb(dtb_phys: u64) -> BootEnvironment;
}

/// Obtain the parsed boot environment from the boot shim.
pub fn parse_boot_environment(dtb_phys: u64) -> BootEnvironment {
    // SAFETY: contract above; the shim is linked into every kernel image.
    unsafe { bekos_parse_dtb(dtb_phys) }
}

/// Mount-root retry policy: the virtio disk may still be enumerating.
const MOUNT_ATTEMPTS: u32 = 5;
const MOUNT_RETRY_DELAY_US: u64 = 1_000_000;

fn memory_regions_from_tree(tree: &DeviceTree) -> (Vec<PhysicalRegion>, Vec<PhysicalRegion>) {
    let mut memory = Vec::new();
    let mut reserved = Vec::new();
    for node in tree.preorder() {
        let name = &tree.node(node).name;
        let is_memory = tree
            .prop(node, "device_type")
            .map(|v| v.starts_with(b"memory"))
            .unwrap_or(false)
            || name.starts_with("memory@");
        if is_memory {
            let mut index = 0;
            while let Some(region) = tree.reg(node, index) {
                memory.push(region);
                index += 1;
            }
        }
        if let Some(parent) = tree.node(node).parent {
            if tree.node(parent).name == "reserved-memory" {
                let mut index = 0;
                while let Some(region) = tree.reg(node, index) {
                    reserved.push(region);
                    index += 1;
                }
            }
        }
    }
    (memory, reserved)
}

fn simple_bus_probe(ctx: &ProbeContext, node: usize) -> ProbeResult {
    if ctx.tree.is_compatible(node, "simple-bus") {
        ProbeResult::Success
    } else {
        ProbeResult::Unrecognised
    }
}

/// Multi-stage kernel initialisation; see the module docs for ordering.
pub fn kernel_init(environment: BootEnvironment, boot_stack: VirtualRegion) -> SysResult<()> {
    crate::print::init_logging(log::LevelFilter::Info);

    // Stage 1: physical memory. Reserved ranges take priority over
    // memory ranges; the kernel image and the DTB are carved out too.
    let (memory, mut reserved) = memory_regions_from_tree(&environment.device_tree);
    reserved.push(environment.kernel_image);
    reserved.push(environment.dtb_region);
    // The allocator works in whole pages; round every carve-out outward.
    for region in &mut reserved {
        let start = crate::utils::align_down(region.start.get() as usize, crate::mm::PAGE_SIZE);
        let end = crate::utils::align_up(
            region.start.get() as usize + region.size,
            crate::mm::PAGE_SIZE,
        );
        region.start = crate::mm::PhysicalAddress::new(start as u64);
        region.size = end - start;
    }
    let annotated = process_memory_regions(&memory, &reserved);
    {
        let mut allocator = PAGE_ALLOCATOR.lock();
        for region in &annotated {
            if region.kind == RegionKind::Memory {
                allocator.register_new_region(region.region);
            }
        }
        for region in &reserved {
            allocator.mark_as_reserved(*region);
        }
    }
    log::info!("bootstrap: physical memory registered");

    // Stage 2: device probing. Order matters only for first-pass
    // convergence; Waiting probes rerun.
    crate::devicetree::run_probe_pipeline(
        &environment.device_tree,
        &[
            &simple_bus_probe,
            &crate::drivers::clock::probe,
            &crate::drivers::gic::probe,
            &crate::drivers::pl011::probe,
            &crate::drivers::gentimer::probe,
            &crate::drivers::virtio::probe,
        ],
    );
    if crate::irq::global_controller().is_none() {
        return Err(SysError::NoSuchDevice);
    }
    crate::arch::enable_interrupts();
    log::info!("bootstrap: devices probed");

    // Stage 3: process manager adopts the boot stack, scheduler tick
    // armed.
    crate::process::initialise_and_adopt("ktask", boot_stack)?;
    crate::process::initialise_scheduling()?;
    log::info!("bootstrap: process manager up");

    // Stage 4: root filesystem, tolerating slow device enumeration.
    let mut mounted = false;
    for attempt in 1..=MOUNT_ATTEMPTS {
        match crate::fs::try_mount_root() {
            Ok(()) => {
                mounted = true;
                break;
            }
            Err(error) => {
                log::warn!(
                    "bootstrap: mount attempt {}/{} failed: {}",
                    attempt,
                    MOUNT_ATTEMPTS,
                    error
                );
                crate::timer::spin_delay_us(MOUNT_RETRY_DELAY_US);
            }
        }
    }
    if !mounted {
        return Err(SysError::NoSuchDevice);
    }

    // Stage 5: first user process.
    let root = crate::fs::root_directory()?;
    match crate::fs::full_path_lookup(root.clone(), "/init", None) {
        Ok(init) => {
            let pid = crate::process::spawn_user_process("init", init, root)?;
            log::info!("bootstrap: init spawned as pid {}", pid);
        }
        Err(error) => {
            log::error!("bootstrap: no /init on the root volume: {}", error);
            return Err(error);
        }
    }
    Ok(())
}
