//! GIC-400 interrupt controller driver.
//!
//! Distributor plus CPU interface, one CPU. Interrupt ids follow the GIC
//! numbering: SGIs 0-15, PPIs 16-31, SPIs from 32.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::devicetree::{ProbeContext, ProbeResult};
use crate::error::{SysError, SysResult};
use crate::irq::{InterruptController, IrqHandler};
use crate::mm::VirtualAddress;

use super::{Device, DeviceKind};

// Distributor registers.
const GICD_CTLR: usize = 0x000;
const GICD_TYPER: usize = 0x004;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_ITARGETSR: usize = 0x800;
const GICD_ICFGR: usize = 0xC00;

const GICD_CTLR_ENABLE: u32 = 1;

// Only the top four priority bits are architecturally guaranteed.
const PRIORITY_DEFAULT: u8 = 0x80;
const PRIORITY_MASK_LOWEST: u32 = 0xF0;

const TARGET_CPU0: u8 = 1;

// CPU interface registers.
const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

const GICC_CTLR_ENABLE: u32 = 1;

/// Spurious interrupt ids start here.
const SPURIOUS_BASE: u32 = 1020;

/// Number of ids in the selection namespace of the device tree cells:
/// cell 0 distinguishes SPI (0) from PPI (1).
const DT_SPI: u32 = 0;
const DT_PPI: u32 = 1;

pub struct Gic400 {
    dist_base: VirtualAddress,
    cpu_base: VirtualAddress,
    line_count: u32,
    handlers: Mutex<BTreeMap<u32, IrqHandler>>,
}

// SAFETY: register blocks are fixed after construction; handler table is
// behind a Mutex; MMIO accesses are individually volatile.
unsafe impl Send for Gic400 {}
// SAFETY: as above.
unsafe impl Sync for Gic400 {}

impl Gic400 {
    /// # Safety
    ///
    /// The bases must be the kernel-virtual aliases of the mapped GIC-400
    /// distributor and CPU interface register blocks.
    pub unsafe fn new(dist_base: VirtualAddress, cpu_base: VirtualAddress) -> Self {
        let gic = Self {
            dist_base,
            cpu_base,
            line_count: 0,
            handlers: Mutex::new(BTreeMap::new()),
        };
        let typer = gic.read_dist(GICD_TYPER);
        let line_count = (32 * ((typer & 0b11111) + 1)).min(1020);

        let gic = Self { line_count, ..gic };
        // Mask everything, then enable forwarding on both halves.
        for group in 0..line_count.div_ceil(32) {
            gic.write_dist(GICD_ICENABLER + group as usize * 4, !0);
        }
        gic.write_dist(GICD_CTLR, GICD_CTLR_ENABLE);
        gic.write_cpu(GICC_PMR, PRIORITY_MASK_LOWEST);
        gic.write_cpu(GICC_CTLR, GICC_CTLR_ENABLE);
        gic
    }

    fn read_dist(&self, offset: usize) -> u32 {
        // SAFETY: mapped register block per constructor contract.
        unsafe { self.dist_base.offset(offset).as_ptr::<u32>().read_volatile() }
    }

    fn write_dist(&self, offset: usize, value: u32) {
        // SAFETY: as in read_dist.
        unsafe {
            self.dist_base
                .offset(offset)
                .as_mut_ptr::<u32>()
                .write_volatile(value)
        }
    }

    fn write_dist_u8(&self, offset: usize, value: u8) {
        // SAFETY: byte-accessible register banks (priority, targets).
        unsafe {
            self.dist_base
                .offset(offset)
                .as_mut_ptr::<u8>()
                .write_volatile(value)
        }
    }

    fn read_cpu(&self, offset: usize) -> u32 {
        // SAFETY: mapped register block per constructor contract.
        unsafe { self.cpu_base.offset(offset).as_ptr::<u32>().read_volatile() }
    }

    fn write_cpu(&self, offset: usize, value: u32) {
        // SAFETY: as in read_cpu.
        unsafe {
            self.cpu_base
                .offset(offset)
                .as_mut_ptr::<u32>()
                .write_volatile(value)
        }
    }

    fn configure_line(&self, id: u32, edge_triggered: bool) {
        self.write_dist_u8(GICD_IPRIORITYR + id as usize, PRIORITY_DEFAULT);
        if id >= 32 {
            self.write_dist_u8(GICD_ITARGETSR + id as usize, TARGET_CPU0);
        }
        // Two config bits per line; bit 1 of the pair selects edge.
        let reg = GICD_ICFGR + (id as usize / 16) * 4;
        let shift = (id % 16) * 2 + 1;
        let mut cfg = self.read_dist(reg);
        if edge_triggered {
            cfg |= 1 << shift;
        } else {
            cfg &= !(1 << shift);
        }
        self.write_dist(reg, cfg);
    }
}

impl InterruptController for Gic400 {
    fn register_interrupt(&self, selection_bytes: &[u8]) -> SysResult<u32> {
        // Device tree cells: (kind, number, flags), big-endian u32 each.
        if selection_bytes.len() < 12 {
            return Err(SysError::InvalidArgument);
        }
        let cell = |i: usize| {
            u32::from_be_bytes([
                selection_bytes[i * 4],
                selection_bytes[i * 4 + 1],
                selection_bytes[i * 4 + 2],
                selection_bytes[i * 4 + 3],
            ])
        };
        let (kind, number, flags) = (cell(0), cell(1), cell(2));
        let id = match kind {
            DT_SPI => number + 32,
            DT_PPI => number + 16,
            _ => return Err(SysError::InvalidArgument),
        };
        if id >= self.line_count {
            return Err(SysError::InvalidArgument);
        }
        // Flag values 1/2 are edge (rising/falling); 4/8 level.
        self.configure_line(id, flags & 0x3 != 0);
        Ok(id)
    }

    fn register_handler(&self, id: u32, handler: IrqHandler) -> SysResult<()> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&id) {
            return Err(SysError::Exists);
        }
        handlers.insert(id, handler);
        Ok(())
    }

    fn enable(&self, id: u32) {
        self.write_dist(GICD_ISENABLER + (id as usize / 32) * 4, 1 << (id % 32));
    }

    fn disable(&self, id: u32) {
        self.write_dist(GICD_ICENABLER + (id as usize / 32) * 4, 1 << (id % 32));
    }

    fn handle_interrupt(&self) {
        loop {
            let iar = self.read_cpu(GICC_IAR);
            let id = iar & 0x3FF;
            if id >= SPURIOUS_BASE {
                return;
            }
            {
                let handlers = self.handlers.lock();
                if let Some(handler) = handlers.get(&id) {
                    handler();
                } else {
                    log::warn!("gic: unhandled interrupt {}", id);
                }
            }
            self.write_cpu(GICC_EOIR, iar);
        }
    }
}

impl Device for Gic400 {
    fn kind(&self) -> DeviceKind {
        DeviceKind::InterruptController
    }

    fn preferred_name_prefix(&self) -> &'static str {
        "intc"
    }
}

/// Probe for `arm,gic-400` nodes.
pub fn probe(ctx: &ProbeContext, node: usize) -> ProbeResult {
    if !ctx.tree.is_compatible(node, "arm,gic-400") {
        return ProbeResult::Unrecognised;
    }
    let (Some(dist), Some(cpu)) = (ctx.tree.reg(node, 0), ctx.tree.reg(node, 1)) else {
        return ProbeResult::Failure;
    };
    // SAFETY: the reg windows name the GIC register blocks, linear-mapped.
    let gic = Arc::new(unsafe {
        Gic400::new(dist.start.to_kernel_virt(), cpu.start.to_kernel_virt())
    });
    crate::irq::set_global_controller(gic.clone());
    super::with_registry(|registry| registry.register_device(gic));
    ProbeResult::Success
}
