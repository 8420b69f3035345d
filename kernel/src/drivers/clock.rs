//! Fixed-rate clock providers.
//!
//! `fixed-clock` nodes carry nothing but a frequency, yet other devices
//! (the PL011 baud divisor) need to resolve their `clocks` phandle to one
//! before they can probe. Providers are indexed by phandle.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::devicetree::{ProbeContext, ProbeResult};

use super::{Device, DeviceKind};

pub struct FixedClock {
    frequency: u32,
}

impl FixedClock {
    pub fn frequency(&self) -> u32 {
        self.frequency
    }
}

impl Device for FixedClock {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Clock
    }

    fn preferred_name_prefix(&self) -> &'static str {
        "clock"
    }
}

static CLOCK_PROVIDERS: Mutex<BTreeMap<u32, Arc<FixedClock>>> = Mutex::new(BTreeMap::new());

/// Resolve a `clocks` phandle to its provider.
pub fn lookup_clock(phandle: u32) -> Option<Arc<FixedClock>> {
    CLOCK_PROVIDERS.lock().get(&phandle).cloned()
}

/// Probe for `fixed-clock` nodes.
pub fn probe(ctx: &ProbeContext, node: usize) -> ProbeResult {
    if !ctx.tree.is_compatible(node, "fixed-clock") {
        return ProbeResult::Unrecognised;
    }
    let Some(frequency) = ctx.tree.prop_u32(node, "clock-frequency", 0) else {
        return ProbeResult::Failure;
    };
    let clock = Arc::new(FixedClock { frequency });
    if let Some(phandle) = ctx.tree.prop_u32(node, "phandle", 0) {
        CLOCK_PROVIDERS.lock().insert(phandle, clock.clone());
    }
    super::with_registry(|registry| registry.register_device(clock));
    ProbeResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicetree::{run_probe_pipeline, DeviceTreeBuilder, NodeStatus};

    #[test]
    fn fixed_clock_probe_registers_provider() {
        let mut builder = DeviceTreeBuilder::new();
        let clk = builder.add_node(0, "apb-pclk");
        builder.set_prop_str(clk, "compatible", "fixed-clock");
        builder.set_prop_cells(clk, "clock-frequency", &[24_000_000]);
        builder.set_prop_cells(clk, "phandle", &[0x8000]);
        let tree = builder.build();

        let statuses = run_probe_pipeline(&tree, &[&probe]);
        assert_eq!(statuses[clk], NodeStatus::Success);
        assert_eq!(lookup_clock(0x8000).unwrap().frequency(), 24_000_000);
    }

    #[test]
    fn missing_frequency_fails() {
        let mut builder = DeviceTreeBuilder::new();
        let clk = builder.add_node(0, "bad-clk");
        builder.set_prop_str(clk, "compatible", "fixed-clock");
        let tree = builder.build();
        let statuses = run_probe_pipeline(&tree, &[&probe]);
        assert_eq!(statuses[clk], NodeStatus::Failed);
    }
}
