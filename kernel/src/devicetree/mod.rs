//! Device tree model and the driver probe pipeline.
//!
//! Blob parsing is done by the boot shim; the kernel consumes an
//! already-parsed [`DeviceTree`]: an arena of nodes with raw properties,
//! plus the accessors drivers need (`compatible`, `reg` with `ranges`
//! translation, `interrupts` with `interrupt-parent` resolution, phandle
//! lookup).
//!
//! Probing walks every node through an ordered list of probe functions.
//! A probe may report [`ProbeResult::Waiting`] when it depends on another
//! node (an interrupt parent, a clock provider) that has not yet probed
//! successfully; the pipeline reruns such nodes until the waiting set is
//! stable. A failing probe abandons its subtree.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::mm::{PhysicalAddress, PhysicalRegion};

/// One device tree node.
pub struct DtNode {
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    properties: BTreeMap<String, Vec<u8>>,
}

/// Parsed device tree, nodes in an arena; index 0 is the root.
pub struct DeviceTree {
    nodes: Vec<DtNode>,
}

fn cells_to_u64(cells: &[u8]) -> u64 {
    let mut value = 0u64;
    for chunk in cells.chunks_exact(4) {
        value = (value << 32) | u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64;
    }
    value
}

impl DeviceTree {
    pub fn node(&self, index: usize) -> &DtNode {
        &self.nodes[index]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn prop(&self, index: usize, name: &str) -> Option<&[u8]> {
        self.nodes[index].properties.get(name).map(|v| v.as_slice())
    }

    /// Big-endian u32 at cell position `cell` of property `name`.
    pub fn prop_u32(&self, index: usize, name: &str, cell: usize) -> Option<u32> {
        let bytes = self.prop(index, name)?;
        let chunk = bytes.get(cell * 4..cell * 4 + 4)?;
        Some(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    /// Does the `compatible` string list contain `wanted`?
    pub fn is_compatible(&self, index: usize, wanted: &str) -> bool {
        self.prop(index, "compatible")
            .map(|bytes| {
                bytes
                    .split(|&b| b == 0)
                    .any(|s| core::str::from_utf8(s) == Ok(wanted))
            })
            .unwrap_or(false)
    }

    fn address_cells(&self, index: usize) -> usize {
        self.prop_u32(index, "#address-cells", 0).unwrap_or(2) as usize
    }

    fn size_cells(&self, index: usize) -> usize {
        self.prop_u32(index, "#size-cells", 0).unwrap_or(1) as usize
    }

    /// The `index`-th `(address, size)` pair of the node's `reg` property,
    /// translated into a CPU physical region through every ancestor's
    /// `ranges`.
    pub fn reg(&self, index: usize, reg_index: usize) -> Option<PhysicalRegion> {
        let parent = self.nodes[index].parent?;
        let addr_cells = self.address_cells(parent);
        let size_cells = self.size_cells(parent);
        let entry_bytes = (addr_cells + size_cells) * 4;
        let reg = self.prop(index, "reg")?;
        let entry = reg.get(reg_index * entry_bytes..(reg_index + 1) * entry_bytes)?;
        let mut address = cells_to_u64(&entry[..addr_cells * 4]);
        let size = cells_to_u64(&entry[addr_cells * 4..]);

        // Walk bus ancestors, translating through each `ranges`.
        let mut bus = parent;
        while let Some(grandparent) = self.nodes[bus].parent {
            address = self.translate_through_ranges(bus, grandparent, address)?;
            bus = grandparent;
        }
        Some(PhysicalRegion::new(
            PhysicalAddress::new(address),
            size as usize,
        ))
    }

    fn translate_through_ranges(
        &self,
        bus: usize,
        bus_parent: usize,
        address: u64,
    ) -> Option<u64> {
        let Some(ranges) = self.prop(bus, "ranges") else {
            // No ranges property: not translatable; treat as identity,
            // which is what the flat QEMU virt topology needs.
            return Some(address);
        };
        if ranges.is_empty() {
            return Some(address);
        }
        let child_cells = self.address_cells(bus);
        let parent_cells = self.address_cells(bus_parent);
        let size_cells = self.size_cells(bus);
        let entry_bytes = (child_cells + parent_cells + size_cells) * 4;
        for entry in ranges.chunks_exact(entry_bytes) {
            let child_base = cells_to_u64(&entry[..child_cells * 4]);
            let parent_base =
                cells_to_u64(&entry[child_cells * 4..(child_cells + parent_cells) * 4]);
            let span = cells_to_u64(&entry[(child_cells + parent_cells) * 4..]);
            if address >= child_base && address - child_base < span {
                return Some(parent_base + (address - child_base));
            }
        }
        None
    }

    /// Raw `interrupts` specifier cells of the node.
    pub fn interrupts(&self, index: usize) -> Option<&[u8]> {
        self.prop(index, "interrupts")
    }

    /// Resolve the node's interrupt parent: an explicit `interrupt-parent`
    /// phandle, or the nearest ancestor carrying one.
    pub fn interrupt_parent(&self, index: usize) -> Option<usize> {
        let mut current = Some(index);
        while let Some(node) = current {
            if let Some(phandle) = self.prop_u32(node, "interrupt-parent", 0) {
                return self.find_by_phandle(phandle);
            }
            current = self.nodes[node].parent;
        }
        None
    }

    pub fn find_by_phandle(&self, phandle: u32) -> Option<usize> {
        (0..self.nodes.len()).find(|&i| self.prop_u32(i, "phandle", 0) == Some(phandle))
    }

    /// Look up `/full/path/to/node`.
    pub fn find_by_path(&self, path: &str) -> Option<usize> {
        let mut current = 0;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = *self.nodes[current]
                .children
                .iter()
                .find(|&&c| self.nodes[c].name == component)?;
        }
        Some(current)
    }

    /// Preorder node indices.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = alloc::vec![0];
        while let Some(node) = stack.pop() {
            order.push(node);
            for &child in self.nodes[node].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }
}

/// Incremental construction, used by the boot shim's parser and by tests.
pub struct DeviceTreeBuilder {
    nodes: Vec<DtNode>,
}

impl DeviceTreeBuilder {
    pub fn new() -> Self {
        Self {
            nodes: alloc::vec![DtNode {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                properties: BTreeMap::new(),
            }],
        }
    }

    pub fn add_node(&mut self, parent: usize, name: &str) -> usize {
        let index = self.nodes.len();
        self.nodes.push(DtNode {
            name: String::from(name),
            parent: Some(parent),
            children: Vec::new(),
            properties: BTreeMap::new(),
        });
        self.nodes[parent].children.push(index);
        index
    }

    pub fn set_prop(&mut self, node: usize, name: &str, value: &[u8]) -> &mut Self {
        self.nodes[node]
            .properties
            .insert(String::from(name), Vec::from(value));
        self
    }

    /// Property of big-endian u32 cells.
    pub fn set_prop_cells(&mut self, node: usize, name: &str, cells: &[u32]) -> &mut Self {
        let mut bytes = Vec::with_capacity(cells.len() * 4);
        for cell in cells {
            bytes.extend_from_slice(&cell.to_be_bytes());
        }
        self.set_prop(node, name, &bytes)
    }

    pub fn set_prop_str(&mut self, node: usize, name: &str, value: &str) -> &mut Self {
        let mut bytes = Vec::from(value.as_bytes());
        bytes.push(0);
        self.set_prop(node, name, &bytes)
    }

    pub fn build(self) -> DeviceTree {
        DeviceTree { nodes: self.nodes }
    }
}

impl Default for DeviceTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Probe pipeline
// ---------------------------------------------------------------------------

/// Outcome of offering a node to one probe function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// Not this probe's node; try the next probe.
    Unrecognised,
    /// Device brought up and registered.
    Success,
    /// Depends on a node that has not probed yet; retry on a later pass.
    Waiting,
    /// Broken node; abandon it and its children.
    Failure,
}

/// Per-node pipeline state, exposed for dependency checks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Success,
    Waiting,
    Failed,
    Unrecognised,
}

/// Context handed to each probe invocation.
pub struct ProbeContext<'a> {
    pub tree: &'a DeviceTree,
    statuses: &'a [NodeStatus],
}

impl ProbeContext<'_> {
    /// Has `node` probed successfully (dependency check for `Waiting`)?
    pub fn is_ready(&self, node: usize) -> bool {
        self.statuses[node] == NodeStatus::Success
    }
}

pub type ProbeFn = dyn Fn(&ProbeContext, usize) -> ProbeResult + Sync;

/// Run `probes` over every node until the waiting set stabilises.
pub fn run_probe_pipeline(tree: &DeviceTree, probes: &[&ProbeFn]) -> Vec<NodeStatus> {
    let mut statuses = alloc::vec![NodeStatus::Pending; tree.node_count()];
    let order = tree.preorder();

    loop {
        let waiting_before: Vec<usize> = (0..statuses.len())
            .filter(|&i| statuses[i] == NodeStatus::Waiting)
            .collect();

        for &node in &order {
            if !matches!(statuses[node], NodeStatus::Pending | NodeStatus::Waiting) {
                continue;
            }
            if in_failed_subtree(tree, &statuses, node) {
                continue;
            }

            let mut outcome = NodeStatus::Unrecognised;
            for probe in probes {
                let ctx = ProbeContext {
                    tree,
                    statuses: &statuses,
                };
                match probe(&ctx, node) {
                    ProbeResult::Unrecognised => continue,
                    ProbeResult::Success => {
                        outcome = NodeStatus::Success;
                        break;
                    }
                    ProbeResult::Waiting => {
                        outcome = NodeStatus::Waiting;
                        break;
                    }
                    ProbeResult::Failure => {
                        log::warn!(
                            "devicetree: probe failed for node '{}'; abandoning subtree",
                            tree.node(node).name
                        );
                        outcome = NodeStatus::Failed;
                        break;
                    }
                }
            }
            statuses[node] = outcome;
        }

        let waiting_after: Vec<usize> = (0..statuses.len())
            .filter(|&i| statuses[i] == NodeStatus::Waiting)
            .collect();
        if waiting_after.is_empty() || waiting_after == waiting_before {
            if !waiting_after.is_empty() {
                log::warn!(
                    "devicetree: {} node(s) still waiting on dependencies",
                    waiting_after.len()
                );
            }
            return statuses;
        }
    }
}

fn in_failed_subtree(tree: &DeviceTree, statuses: &[NodeStatus], node: usize) -> bool {
    let mut current = tree.node(node).parent;
    while let Some(ancestor) = current {
        if statuses[ancestor] == NodeStatus::Failed {
            return true;
        }
        current = tree.node(ancestor).parent;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn virt_like_tree() -> DeviceTree {
        let mut builder = DeviceTreeBuilder::new();
        let root = 0;
        builder.set_prop_cells(root, "#address-cells", &[2]);
        builder.set_prop_cells(root, "#size-cells", &[2]);

        let intc = builder.add_node(root, "intc@8000000");
        builder.set_prop_str(intc, "compatible", "arm,gic-400");
        builder.set_prop_cells(intc, "phandle", &[1]);
        builder.set_prop_cells(
            intc,
            "reg",
            &[0x0, 0x0800_0000, 0x0, 0x1_0000, 0x0, 0x0801_0000, 0x0, 0x1_0000],
        );

        let uart = builder.add_node(root, "pl011@9000000");
        builder.set_prop_str(uart, "compatible", "arm,pl011");
        builder.set_prop_cells(uart, "reg", &[0x0, 0x0900_0000, 0x0, 0x1000]);
        builder.set_prop_cells(uart, "interrupts", &[0, 1, 4]);
        builder.set_prop_cells(uart, "interrupt-parent", &[1]);
        builder.build()
    }

    #[test]
    fn reg_and_phandle_lookup() {
        let tree = virt_like_tree();
        let intc = tree.find_by_path("/intc@8000000").unwrap();
        assert_eq!(tree.find_by_phandle(1), Some(intc));

        let reg0 = tree.reg(intc, 0).unwrap();
        assert_eq!(reg0.start.get(), 0x0800_0000);
        assert_eq!(reg0.size, 0x1_0000);
        let reg1 = tree.reg(intc, 1).unwrap();
        assert_eq!(reg1.start.get(), 0x0801_0000);
        assert!(tree.reg(intc, 2).is_none());
    }

    #[test]
    fn ranges_translation() {
        let mut builder = DeviceTreeBuilder::new();
        let root = 0;
        builder.set_prop_cells(root, "#address-cells", &[2]);
        builder.set_prop_cells(root, "#size-cells", &[2]);
        let bus = builder.add_node(root, "soc");
        builder.set_prop_str(bus, "compatible", "simple-bus");
        builder.set_prop_cells(bus, "#address-cells", &[1]);
        builder.set_prop_cells(bus, "#size-cells", &[1]);
        // Child 0x0 maps to parent 0x3F00_0000, 16 MiB window.
        builder.set_prop_cells(bus, "ranges", &[0x0, 0x0, 0x3F00, 0x0000, 0x0100_0000]);
        let dev = builder.add_node(bus, "uart@1000");
        builder.set_prop_cells(dev, "reg", &[0x1000, 0x100]);
        let tree = builder.build();

        let dev = tree.find_by_path("/soc/uart@1000").unwrap();
        let reg = tree.reg(dev, 0).unwrap();
        assert_eq!(reg.start.get(), 0x3F00_1000);
        assert_eq!(reg.size, 0x100);
    }

    #[test]
    fn interrupt_parent_resolves_through_ancestors() {
        let tree = virt_like_tree();
        let uart = tree.find_by_path("/pl011@9000000").unwrap();
        let intc = tree.find_by_path("/intc@8000000").unwrap();
        assert_eq!(tree.interrupt_parent(uart), Some(intc));
        assert_eq!(tree.interrupts(uart).map(|b| b.len()), Some(12));
    }

    #[test]
    fn pipeline_reruns_waiting_until_dependency_ready() {
        // The UART sits before its interrupt controller in document order,
        // so the first pass leaves it waiting and a rerun resolves it.
        let mut builder = DeviceTreeBuilder::new();
        let uart = builder.add_node(0, "pl011@9000000");
        builder.set_prop_str(uart, "compatible", "arm,pl011");
        builder.set_prop_cells(uart, "interrupt-parent", &[1]);
        let intc = builder.add_node(0, "intc@8000000");
        builder.set_prop_str(intc, "compatible", "arm,gic-400");
        builder.set_prop_cells(intc, "phandle", &[1]);
        let tree = builder.build();

        let intc_probe = |ctx: &ProbeContext, node: usize| {
            if ctx.tree.is_compatible(node, "arm,gic-400") {
                ProbeResult::Success
            } else {
                ProbeResult::Unrecognised
            }
        };
        // The UART needs its interrupt parent up first.
        let uart_probe = |ctx: &ProbeContext, node: usize| {
            if !ctx.tree.is_compatible(node, "arm,pl011") {
                return ProbeResult::Unrecognised;
            }
            match ctx.tree.interrupt_parent(node) {
                Some(parent) if ctx.is_ready(parent) => ProbeResult::Success,
                Some(_) => ProbeResult::Waiting,
                None => ProbeResult::Failure,
            }
        };

        let statuses = run_probe_pipeline(&tree, &[&uart_probe, &intc_probe]);
        assert_eq!(statuses[uart], NodeStatus::Success);
        assert_eq!(statuses[intc], NodeStatus::Success);
    }

    #[test]
    fn failed_subtree_is_abandoned() {
        let mut builder = DeviceTreeBuilder::new();
        let bad = builder.add_node(0, "bus");
        builder.set_prop_str(bad, "compatible", "broken-bus");
        let child = builder.add_node(bad, "child");
        builder.set_prop_str(child, "compatible", "fine-device");
        let tree = builder.build();

        let bus_probe = |ctx: &ProbeContext, node: usize| {
            if ctx.tree.is_compatible(node, "broken-bus") {
                ProbeResult::Failure
            } else {
                ProbeResult::Unrecognised
            }
        };
        let child_probe = |ctx: &ProbeContext, node: usize| {
            if ctx.tree.is_compatible(node, "fine-device") {
                ProbeResult::Success
            } else {
                ProbeResult::Unrecognised
            }
        };
        let statuses = run_probe_pipeline(&tree, &[&bus_probe, &child_probe]);
        assert_eq!(statuses[bad], NodeStatus::Failed);
        // The child never ran: still pending, not probed behind a failed bus.
        assert_eq!(statuses[child], NodeStatus::Pending);
    }
}
