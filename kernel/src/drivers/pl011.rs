//! PL011 UART console driver.
//!
//! Probed from the device tree once its clock provider is up; on success
//! it replaces the early console sink so all `println!`/log output flows
//! through the real device.

use alloc::sync::Arc;

use spin::Once;

use crate::devicetree::{ProbeContext, ProbeResult};
use crate::mm::VirtualAddress;

use super::{Device, DeviceKind, DeviceProtocol};

// Register offsets.
const UARTDR: usize = 0x00;
const UARTFR: usize = 0x18;
const UARTIBRD: usize = 0x24;
const UARTFBRD: usize = 0x28;
const UARTLCR_H: usize = 0x2C;
const UARTCR: usize = 0x30;

const FR_TXFF: u32 = 1 << 5;

const LCR_H_FEN: u32 = 1 << 4;
const LCR_H_WLEN_8: u32 = 0b11 << 5;

const CR_UARTEN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;
const CR_RXE: u32 = 1 << 9;

pub struct Pl011Uart {
    base: VirtualAddress,
}

// SAFETY: the MMIO base is fixed after construction and register access
// is independent per call; the device serialises its own FIFO.
unsafe impl Send for Pl011Uart {}
// SAFETY: as above; concurrent writers interleave characters at worst.
unsafe impl Sync for Pl011Uart {}

impl Pl011Uart {
    /// # Safety
    ///
    /// `base` must be the kernel-virtual alias of a mapped PL011 register
    /// block.
    pub unsafe fn new(base: VirtualAddress, uart_clock_hz: u32, baud: u32) -> Self {
        let uart = Self { base };
        // Disable, program 8n1 with FIFOs and the baud divisor, re-enable.
        uart.write_reg(UARTCR, 0);
        let divider_x64 = (uart_clock_hz * 4) / baud;
        uart.write_reg(UARTIBRD, divider_x64 >> 6);
        uart.write_reg(UARTFBRD, divider_x64 & 0x3F);
        uart.write_reg(UARTLCR_H, LCR_H_FEN | LCR_H_WLEN_8);
        uart.write_reg(UARTCR, CR_UARTEN | CR_TXE | CR_RXE);
        uart
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // SAFETY: construction guarantees the register block is mapped;
        // volatile MMIO write.
        unsafe {
            self.base.offset(offset).as_mut_ptr::<u32>().write_volatile(value);
        }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: as in write_reg.
        unsafe { self.base.offset(offset).as_ptr::<u32>().read_volatile() }
    }

    pub fn write_byte(&self, byte: u8) {
        while self.read_reg(UARTFR) & FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        self.write_reg(UARTDR, byte as u32);
    }

    pub fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl Device for Pl011Uart {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Uart
    }

    fn userspace_protocol(&self) -> Option<DeviceProtocol> {
        Some(DeviceProtocol::CharStream)
    }

    fn preferred_name_prefix(&self) -> &'static str {
        "uart"
    }
}

static CONSOLE_UART: Once<Arc<Pl011Uart>> = Once::new();

fn console_sink(s: &str) {
    if let Some(uart) = CONSOLE_UART.get() {
        uart.write_str(s);
    }
}

/// Probe for `arm,pl011` nodes.
pub fn probe(ctx: &ProbeContext, node: usize) -> ProbeResult {
    if !ctx.tree.is_compatible(node, "arm,pl011") {
        return ProbeResult::Unrecognised;
    }
    let Some(reg) = ctx.tree.reg(node, 0) else {
        return ProbeResult::Failure;
    };
    // The baud divisor needs the UART clock; wait for its provider.
    let clock_hz = match ctx.tree.prop_u32(node, "clocks", 0) {
        Some(phandle) => match super::clock::lookup_clock(phandle) {
            Some(clock) => clock.frequency(),
            None => return ProbeResult::Waiting,
        },
        None => 24_000_000,
    };

    // SAFETY: `reg` names the PL011 register block, linear-mapped.
    let uart = Arc::new(unsafe {
        Pl011Uart::new(reg.start.to_kernel_virt(), clock_hz, 115_200)
    });
    CONSOLE_UART.call_once(|| uart.clone());
    crate::print::set_console(console_sink);
    super::with_registry(|registry| registry.register_device(uart));
    ProbeResult::Success
}
