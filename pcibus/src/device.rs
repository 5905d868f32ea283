//! Device nodes, BAR sizing, and the enumerated device tree.

use alloc_crate::vec::Vec;
use core::fmt;
use core::fmt::Display;

use bitflags::bitflags;
use hashbrown::HashMap;
use pcibus_structures::{Arena, NodeId};

use crate::address::PCIAddress;
use crate::config::{self, regs, BridgeControl, ConfigAccess, ConfigError, HeaderKind};
use crate::resource::ResourceKind;

pub type DeviceId = NodeId<DeviceNode>;

bitflags! {
    /// Decode and forwarding properties of a bridge, read from the
    /// bridge control register and the window capability bits.
    pub struct BridgeAttributes: u8 {
        /// Forwards ISA I/O aliases (0x100-0x3FF) to the secondary bus.
        const ISA_FORWARDING = 1 << 0;
        /// Forwards legacy VGA ranges to the secondary bus.
        const VGA_FORWARDING = 1 << 1;
        const VGA_16BIT_DECODE = 1 << 2;
        /// The prefetchable window decodes 64-bit addresses.
        const PREFETCH_64 = 1 << 3;
        /// No prefetchable window at all; prefetchable demand must be
        /// combined into the non-prefetchable window.
        const NO_PREFETCH_WINDOW = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Ordinary type-0 function.
    Function,
    /// Positive-decode PCI-PCI bridge.
    Bridge,
    /// Subtractive-decode bridge (claims everything nobody else does);
    /// treated as ISA-forwarding for aperture purposes.
    SubtractiveBridge,
}

impl DeviceKind {
    pub fn is_bridge(self) -> bool {
        !matches!(self, DeviceKind::Function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    Io,
    Mem32 { prefetchable: bool },
    Mem64 { prefetchable: bool },
}

impl BarKind {
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            BarKind::Io => ResourceKind::Io,
            BarKind::Mem32 { prefetchable: false } => ResourceKind::Mem32,
            BarKind::Mem32 { prefetchable: true } => ResourceKind::PMem32,
            BarKind::Mem64 { prefetchable: false } => ResourceKind::Mem64,
            BarKind::Mem64 { prefetchable: true } => ResourceKind::PMem64,
        }
    }
}

/// One sized base address register.
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub(crate) index: u8,
    pub(crate) kind: BarKind,
    pub(crate) length: u64,
    /// Alignment mask (alignment minus one); BARs are naturally
    /// aligned, so this is `length - 1`.
    pub(crate) align: u64,
}

impl Bar {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn kind(&self) -> BarKind {
        self.kind
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn alignment(&self) -> u64 {
        self.align
    }

    /// Size the BAR at `index` with the write-ones protocol, restoring
    /// the original register contents afterwards. Returns `None` for an
    /// unimplemented BAR.
    pub(crate) fn probe(
        cfg: &dyn ConfigAccess,
        address: PCIAddress,
        index: u8,
    ) -> Result<Option<Bar>, ConfigError> {
        let offset = regs::BAR0 + 4 * (index as u16);

        let d1 = cfg.read(address, offset)?;
        let io = (d1 & 1) == 1;
        let large = !io && (d1 & 0b110) == 0b100;
        let prefetch = !io && (d1 & 0b1000) != 0;

        let length: u64;
        if large {
            let d2 = cfg.read(address, offset + 4)?;

            cfg.write(address, offset, 0xFFFF_FFFF)?;
            cfg.write(address, offset + 4, 0xFFFF_FFFF)?;
            let s1 = cfg.read(address, offset)?;
            let s2 = cfg.read(address, offset + 4)?;
            cfg.write(address, offset, d1)?;
            cfg.write(address, offset + 4, d2)?;

            let t = ((s2 as u64) << 32) | ((s1 & 0xFFFF_FFF0) as u64);
            if t == 0 {
                return Ok(None);
            }

            length = (!t).wrapping_add(1);
        } else {
            cfg.write(address, offset, 0xFFFF_FFFF)?;
            let s1 = cfg.read(address, offset)?;
            cfg.write(address, offset, d1)?;

            let mut t = if io { s1 & 0xFFFF_FFFC } else { s1 & 0xFFFF_FFF0 };
            if t == 0 {
                return Ok(None);
            }

            // 16-bit I/O decoders leave the upper word unimplemented.
            if io && (t & 0xFFFF_0000) == 0 {
                t |= 0xFFFF_0000;
            }

            length = ((!t).wrapping_add(1)) as u64;
        }

        let kind = if io {
            BarKind::Io
        } else if large {
            BarKind::Mem64 {
                prefetchable: prefetch,
            }
        } else {
            BarKind::Mem32 {
                prefetchable: prefetch,
            }
        };

        Ok(Some(Bar {
            index,
            kind,
            length,
            align: length - 1,
        }))
    }
}

impl Display for Bar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BAR #{}: ", self.index)?;

        match self.kind {
            BarKind::Io => write!(f, "I/O ports ")?,
            BarKind::Mem32 { prefetchable } => {
                if prefetchable {
                    write!(f, "32-bit prefetchable memory ")?;
                } else {
                    write!(f, "32-bit memory ")?;
                }
            }
            BarKind::Mem64 { prefetchable } => {
                if prefetchable {
                    write!(f, "64-bit prefetchable memory ")?;
                } else {
                    write!(f, "64-bit memory ")?;
                }
            }
        }

        match self.length {
            0..=0x400 => write!(f, "({}B)", self.length),
            0x401..=0x100000 => write!(f, "({}K)", self.length >> 10),
            0x100001..=0x40000000 => write!(f, "({}M)", self.length >> 20),
            _ => write!(f, "({}G)", self.length >> 30),
        }
    }
}

/// Expansion ROM demand, sized by the [`rom`](crate::rom) pass.
#[derive(Debug, Clone, Copy)]
pub struct RomBar {
    pub(crate) offset: u16,
    pub(crate) length: u64,
    pub(crate) align: u64,
}

impl RomBar {
    pub fn length(&self) -> u64 {
        self.length
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeInfo {
    pub(crate) secondary_bus: u8,
    pub(crate) subordinate_bus: u8,
    pub(crate) attributes: BridgeAttributes,
}

/// One discovered function.
pub struct DeviceNode {
    pub(crate) address: PCIAddress,
    pub(crate) vendor_id: u16,
    pub(crate) device_id: u16,
    pub(crate) major_class: u8,
    pub(crate) minor_class: u8,
    pub(crate) prog_if: u8,
    pub(crate) kind: DeviceKind,
    pub(crate) multi_function: bool,
    pub(crate) bars: Vec<Bar>,
    pub(crate) rom: Option<RomBar>,
    pub(crate) bridge: Option<BridgeInfo>,
    pub(crate) parent: Option<DeviceId>,
    pub(crate) children: Vec<DeviceId>,
    /// May be discarded by the allocation adjuster under resource
    /// starvation.
    pub(crate) rejectable: bool,
}

impl DeviceNode {
    pub fn address(&self) -> PCIAddress {
        self.address
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn class(&self) -> (u8, u8, u8) {
        (self.major_class, self.minor_class, self.prog_if)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn rom(&self) -> Option<&RomBar> {
        self.rom.as_ref()
    }

    pub fn is_bridge(&self) -> bool {
        self.kind.is_bridge()
    }

    pub fn secondary_bus(&self) -> Option<u8> {
        self.bridge.as_ref().map(|b| b.secondary_bus)
    }

    pub fn subordinate_bus(&self) -> Option<u8> {
        self.bridge.as_ref().map(|b| b.subordinate_bus)
    }

    pub fn bridge_attributes(&self) -> Option<BridgeAttributes> {
        self.bridge.as_ref().map(|b| b.attributes)
    }
}

impl Display for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] class {:02x}.{:02x}.{:02x}",
            self.address,
            self.vendor_id,
            self.device_id,
            self.major_class,
            self.minor_class,
            self.prog_if
        )?;

        if let Some(bridge) = &self.bridge {
            write!(
                f,
                " bus [{:02x}-{:02x}]",
                bridge.secondary_bus, bridge.subordinate_bus
            )?;
        }

        Ok(())
    }
}

/// Probe one function and build its (detached) node.
///
/// Returns `Ok(None)` when nothing responds at the address; every
/// configuration error during the probe is the caller's cue to treat
/// the slot as empty.
pub(crate) fn probe_function(
    cfg: &dyn ConfigAccess,
    address: PCIAddress,
) -> Result<Option<DeviceNode>, ConfigError> {
    let (vendor_id, device_id) = config::read_dev_vendor_id(cfg, address)?;
    if vendor_id == 0xFFFF || vendor_id == 0x0000 {
        return Ok(None);
    }

    let (major_class, minor_class, prog_if) = config::read_class(cfg, address)?;
    let multi_function = config::is_multi_function(cfg, address)?;
    let header = config::read_header_kind(cfg, address)?;

    let (kind, max_bars) = match header {
        Some(HeaderKind::Device) => (DeviceKind::Function, 6),
        Some(HeaderKind::PciBridge) => {
            if prog_if == 0x01 {
                (DeviceKind::SubtractiveBridge, 2)
            } else {
                (DeviceKind::Bridge, 2)
            }
        }
        Some(HeaderKind::CardBusBridge) | None => {
            log::debug!("pci: {} has unsupported header type, no BARs probed", address);
            (DeviceKind::Function, 0)
        }
    };

    let mut bars = Vec::new();
    let mut index: u8 = 0;
    while index < max_bars {
        match Bar::probe(cfg, address, index)? {
            Some(bar) => {
                let skip = matches!(bar.kind, BarKind::Mem64 { .. });
                bars.push(bar);
                index += if skip { 2 } else { 1 };
            }
            None => index += 1,
        }
    }

    let bridge = if kind.is_bridge() {
        let mut attributes = probe_bridge_attributes(cfg, address)?;
        if kind == DeviceKind::SubtractiveBridge {
            attributes |= BridgeAttributes::ISA_FORWARDING;
        }

        Some(BridgeInfo {
            secondary_bus: 0,
            subordinate_bus: 0,
            attributes,
        })
    } else {
        None
    };

    Ok(Some(DeviceNode {
        address,
        vendor_id,
        device_id,
        major_class,
        minor_class,
        prog_if,
        kind,
        multi_function,
        bars,
        rom: None,
        bridge,
        parent: None,
        children: Vec::new(),
        rejectable: false,
    }))
}

fn probe_bridge_attributes(
    cfg: &dyn ConfigAccess,
    address: PCIAddress,
) -> Result<BridgeAttributes, ConfigError> {
    let control = config::read_bridge_control(cfg, address)?;

    let mut attributes = BridgeAttributes::empty();
    if control.contains(BridgeControl::ISA_ENABLE) {
        attributes |= BridgeAttributes::ISA_FORWARDING;
    }
    if control.contains(BridgeControl::VGA_ENABLE) {
        attributes |= BridgeAttributes::VGA_FORWARDING;
    }
    if control.contains(BridgeControl::VGA_16BIT_DECODE) {
        attributes |= BridgeAttributes::VGA_16BIT_DECODE;
    }

    // The prefetchable window's capability nibble tells us whether it
    // decodes 64 bits; a window that reads back all-zero after a
    // write-ones probe does not exist at all.
    let original = cfg.read(address, regs::PREFETCH_WINDOW)?;
    cfg.write(address, regs::PREFETCH_WINDOW, 0xFFFF_FFFF)?;
    let probed = cfg.read(address, regs::PREFETCH_WINDOW)?;
    cfg.write(address, regs::PREFETCH_WINDOW, original)?;

    if probed == 0 {
        attributes |= BridgeAttributes::NO_PREFETCH_WINDOW;
    } else if (probed & 0xF) == 0x1 {
        attributes |= BridgeAttributes::PREFETCH_64;
    }

    Ok(attributes)
}

/// The enumerated topology: an arena of nodes plus the root functions
/// of every host bridge, mirroring the physical hierarchy.
pub struct DeviceTree {
    arena: Arena<DeviceNode>,
    roots: Vec<DeviceId>,
    by_address: HashMap<PCIAddress, DeviceId>,
}

impl DeviceTree {
    pub fn new() -> DeviceTree {
        DeviceTree {
            arena: Arena::new(),
            roots: Vec::new(),
            by_address: HashMap::new(),
        }
    }

    /// Number of reachable devices.
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn roots(&self) -> &[DeviceId] {
        &self.roots
    }

    pub fn node(&self, id: DeviceId) -> &DeviceNode {
        &self.arena[id]
    }

    pub(crate) fn node_mut(&mut self, id: DeviceId) -> &mut DeviceNode {
        &mut self.arena[id]
    }

    pub fn lookup(&self, address: PCIAddress) -> Option<DeviceId> {
        self.by_address.get(&address).copied()
    }

    pub fn get(&self, address: PCIAddress) -> Option<&DeviceNode> {
        self.lookup(address).map(|id| self.node(id))
    }

    pub fn children(&self, id: DeviceId) -> &[DeviceId] {
        &self.arena[id].children
    }

    pub(crate) fn insert(&mut self, mut node: DeviceNode, parent: Option<DeviceId>) -> DeviceId {
        let address = node.address;
        node.parent = parent;

        let id = self.arena.alloc(node);
        match parent {
            Some(p) => self.arena[p].children.push(id),
            None => self.roots.push(id),
        }

        if self.by_address.insert(address, id).is_some() {
            panic!("device {} enumerated twice", address);
        }

        id
    }

    /// Detach `id` and everything beneath it; the nodes become
    /// unreachable from the tree and their addresses are forgotten.
    pub(crate) fn detach_subtree(&mut self, id: DeviceId) {
        match self.arena[id].parent {
            Some(p) => self.arena[p].children.retain(|c| *c != id),
            None => self.roots.retain(|c| *c != id),
        }

        self.unmap_recursive(id);
    }

    fn unmap_recursive(&mut self, id: DeviceId) {
        let address = self.arena[id].address;
        self.by_address.remove(&address);

        let children = core::mem::take(&mut self.arena[id].children);
        for child in children {
            self.unmap_recursive(child);
        }
    }

    /// Pre-order walk of a subtree.
    pub fn preorder(&self, root: DeviceId) -> Vec<DeviceId> {
        let mut out = Vec::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.arena[id].children.iter().rev() {
                stack.push(*child);
            }
        }

        out
    }

    /// Pre-order walk of the whole forest.
    pub fn preorder_all(&self) -> Vec<DeviceId> {
        let mut out = Vec::new();
        for root in self.roots.iter() {
            out.extend(self.preorder(*root));
        }
        out
    }

    /// Tree rendering for diagnostics.
    pub fn topology(&self) -> TopologyDisplay<'_> {
        TopologyDisplay { tree: self }
    }
}

impl Default for DeviceTree {
    fn default() -> DeviceTree {
        DeviceTree::new()
    }
}

pub struct TopologyDisplay<'a> {
    tree: &'a DeviceTree,
}

impl TopologyDisplay<'_> {
    fn fmt_node(
        &self,
        f: &mut fmt::Formatter<'_>,
        id: DeviceId,
        prefix: &mut alloc_crate::string::String,
        last: bool,
    ) -> fmt::Result {
        let node = self.tree.node(id);
        let branch = if last { "\\-" } else { "+-" };
        writeln!(f, "{}{}{}", prefix, branch, node)?;

        let saved = prefix.len();
        prefix.push_str(if last { "  " } else { "| " });

        let children = self.tree.children(id);
        for (i, child) in children.iter().enumerate() {
            self.fmt_node(f, *child, prefix, i == children.len() - 1)?;
        }

        prefix.truncate(saved);
        Ok(())
    }
}

impl Display for TopologyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prefix = alloc_crate::string::String::new();
        for root in self.tree.roots() {
            let node = self.tree.node(*root);
            writeln!(f, "[{:04x}:{:02x}]", node.address.segment(), node.address.bus())?;
            self.fmt_node(f, *root, &mut prefix, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::mock::{MockBar, MockConfigSpace, MockFunction};
    use std::prelude::v1::*;

    #[test]
    fn bar_probe_sizes_and_restores() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(
            &[],
            (3, 0),
            MockFunction::endpoint(0x8086, 0x100E, (0x02, 0x00, 0x00))
                .bar(MockBar::mem32(0, 0x2_0000, false))
                .bar(MockBar::io(1, 0x40))
                .bar(MockBar::mem64(2, 0x10_0000, true)),
        );

        let addr = PCIAddress::new(0, 0, 3, 0);
        let node = probe_function(&mock, addr).unwrap().unwrap();

        assert_eq!(node.kind(), DeviceKind::Function);
        assert_eq!(node.bars().len(), 3);

        let b0 = &node.bars()[0];
        assert_eq!(b0.kind(), BarKind::Mem32 { prefetchable: false });
        assert_eq!(b0.length(), 0x2_0000);
        assert_eq!(b0.alignment(), 0x1_FFFF);

        let b1 = &node.bars()[1];
        assert_eq!(b1.kind(), BarKind::Io);
        assert_eq!(b1.length(), 0x40);

        let b2 = &node.bars()[2];
        assert_eq!(b2.index(), 2);
        assert_eq!(b2.kind(), BarKind::Mem64 { prefetchable: true });
        assert_eq!(b2.length(), 0x10_0000);

        // sizing probes must leave the registers as they found them
        assert_eq!(mock.register(addr, 0x10), Some(0));
        assert_eq!(mock.register(addr, 0x18), Some(0x8 | 0x4));
    }

    #[test]
    fn bridge_probe_reads_attributes() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(
            &[],
            (1, 0),
            MockFunction::bridge(0x8086, 0x2448, 0x00).isa().vga().pref64(),
        );

        let addr = PCIAddress::new(0, 0, 1, 0);
        let node = probe_function(&mock, addr).unwrap().unwrap();

        assert_eq!(node.kind(), DeviceKind::Bridge);
        let attrs = node.bridge_attributes().unwrap();
        assert!(attrs.contains(BridgeAttributes::ISA_FORWARDING));
        assert!(attrs.contains(BridgeAttributes::VGA_FORWARDING));
        assert!(attrs.contains(BridgeAttributes::PREFETCH_64));
        assert!(!attrs.contains(BridgeAttributes::NO_PREFETCH_WINDOW));
    }

    #[test]
    fn subtractive_bridge_forwards_isa() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(&[], (2, 0), MockFunction::bridge(0x1011, 0x0024, 0x01));

        let node = probe_function(&mock, PCIAddress::new(0, 0, 2, 0))
            .unwrap()
            .unwrap();

        assert_eq!(node.kind(), DeviceKind::SubtractiveBridge);
        assert!(node
            .bridge_attributes()
            .unwrap()
            .contains(BridgeAttributes::ISA_FORWARDING));
    }

    #[test]
    fn detach_subtree_forgets_addresses() {
        let mut tree = DeviceTree::new();
        let mut mock = MockConfigSpace::new(0);
        mock.add(&[], (0, 0), MockFunction::bridge(0x8086, 0x2448, 0x00));
        mock.add(&[], (1, 0), MockFunction::endpoint(0x8086, 0x100E, (2, 0, 0)));

        let bridge = probe_function(&mock, PCIAddress::new(0, 0, 0, 0))
            .unwrap()
            .unwrap();
        let leaf = probe_function(&mock, PCIAddress::new(0, 0, 1, 0))
            .unwrap()
            .unwrap();

        let bridge_id = tree.insert(bridge, None);
        let _leaf_id = tree.insert(leaf, Some(bridge_id));

        assert_eq!(tree.len(), 2);
        tree.detach_subtree(bridge_id);
        assert_eq!(tree.len(), 0);
        assert!(tree.lookup(PCIAddress::new(0, 0, 1, 0)).is_none());
        assert!(tree.roots().is_empty());
    }
}
