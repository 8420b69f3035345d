//! Virtio-mmio transport and device class drivers.

pub mod blk;
pub mod fb;
pub mod mmio;
pub mod queue;

use alloc::sync::Arc;

use crate::devicetree::{ProbeContext, ProbeResult};

use mmio::{MmioTransport, DEVICE_ID_BLOCK, DEVICE_ID_GPU};

/// DMA address of a kernel-virtual pointer.
///
/// Kernel memory (heap and page allocations) lives in the physical linear
/// map, so the device-visible address is the linear-map inverse. Host
/// test builds have no such mapping and use the pointer bits directly.
pub(crate) fn virt_to_dma(ptr: *const u8) -> u64 {
    #[cfg(target_os = "none")]
    {
        crate::mm::VirtualAddress::new(ptr as usize)
            .to_physical()
            .map(|p| p.get())
            .unwrap_or(ptr as u64)
    }
    #[cfg(not(target_os = "none"))]
    {
        ptr as u64
    }
}

/// Probe for `virtio,mmio` nodes: wire the interrupt, identify the device
/// class, and hand the transport to its driver.
pub fn probe(ctx: &ProbeContext, node: usize) -> ProbeResult {
    if !ctx.tree.is_compatible(node, "virtio,mmio") {
        return ProbeResult::Unrecognised;
    }
    let Some(controller) = crate::irq::global_controller() else {
        return ProbeResult::Waiting;
    };
    let Some(reg) = ctx.tree.reg(node, 0) else {
        return ProbeResult::Failure;
    };

    // SAFETY: `reg` names the device's register window, linear-mapped.
    let transport = match unsafe { MmioTransport::new(reg.start.to_kernel_virt()) } {
        Ok(transport) => Arc::new(transport),
        // An absent backend leaves a transport with device id 0; QEMU
        // instantiates 32 of these slots. Not an error worth logging.
        Err(_) => return ProbeResult::Failure,
    };
    let device_id = transport.device_id();
    if device_id == 0 {
        return ProbeResult::Unrecognised;
    }

    let Some(specifier) = ctx.tree.interrupts(node) else {
        return ProbeResult::Failure;
    };
    let Ok(irq_id) = controller.register_interrupt(specifier) else {
        return ProbeResult::Failure;
    };
    {
        let for_irq = transport.clone();
        if controller
            .register_handler(irq_id, alloc::boxed::Box::new(move || for_irq.on_interrupt()))
            .is_err()
        {
            return ProbeResult::Failure;
        }
    }
    controller.enable(irq_id);

    let result = match device_id {
        DEVICE_ID_BLOCK => blk::VirtioBlockDevice::create(transport),
        DEVICE_ID_GPU => fb::FramebufferDevice::create(transport),
        other => {
            log::debug!("virtio: unhandled device class {}", other);
            return ProbeResult::Unrecognised;
        }
    };
    match result {
        Ok(()) => ProbeResult::Success,
        Err(error) => {
            log::warn!("virtio: device bring-up failed: {}", error);
            ProbeResult::Failure
        }
    }
}
