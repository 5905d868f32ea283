//! Post-order construction of the five resource trees.

use alloc_crate::vec::Vec;

use pcibus_structures::RangeList;

use super::calc;
use super::{
    HostBridgeResources, ResourceId, ResourceKind, ResourceNode, ResourceOwner, ResourceUsage,
};
use crate::authority::HostBridgeHandle;
use crate::device::{BridgeAttributes, DeviceId, DeviceTree};
use crate::session::EnumerationOptions;

/// Degrade steps already applied to a host bridge's trees.
///
/// Building is deterministic, so a degrade step is implemented by
/// rebuilding the trees with the corresponding fold enabled; the
/// allocation adjuster flips these one at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DegradeSet {
    /// Fold Mem64 into Mem32 and PMem64 into PMem32.
    pub fold_mem64: bool,
    /// Fold prefetchable demand into the non-prefetchable trees.
    pub fold_prefetch: bool,
    /// Discard rejectable device subtrees and padding reservations.
    pub reject_devices: bool,
}

impl DegradeSet {
    fn effective_kind(&self, kind: ResourceKind) -> ResourceKind {
        let mut kind = kind;

        if self.fold_prefetch {
            kind = match kind {
                ResourceKind::PMem32 => ResourceKind::Mem32,
                ResourceKind::PMem64 => ResourceKind::Mem64,
                other => other,
            };
        }

        if self.fold_mem64 {
            kind = match kind {
                ResourceKind::Mem64 => ResourceKind::Mem32,
                ResourceKind::PMem64 => ResourceKind::PMem32,
                other => other,
            };
        }

        kind
    }
}

/// Build the five resource trees for one host bridge from the device
/// subtrees rooted at `roots` (the top-level functions on its root
/// bus), in bus/device/function declaration order.
pub(crate) fn build_resources(
    tree: &DeviceTree,
    roots: &[DeviceId],
    handle: HostBridgeHandle,
    options: &EnumerationOptions,
    degrade: DegradeSet,
) -> HostBridgeResources {
    let mut res = HostBridgeResources::new(handle);
    let mut top: PerKind = PerKind::default();

    for id in roots.iter().copied() {
        collect_device(tree, id, &mut res, &mut top, options, degrade);
    }

    for kind in ResourceKind::ALL {
        let root = res.root_id(kind);
        res.node_mut(root).children = top.take(kind);
        calc::calculate(&mut res, root, &RangeList::new());
    }

    res
}

#[derive(Default)]
struct PerKind {
    lists: [Vec<ResourceId>; ResourceKind::COUNT],
}

impl PerKind {
    fn push(&mut self, kind: ResourceKind, id: ResourceId) {
        self.lists[kind.index()].push(id);
    }

    fn take(&mut self, kind: ResourceKind) -> Vec<ResourceId> {
        core::mem::take(&mut self.lists[kind.index()])
    }

    fn append(&mut self, kind: ResourceKind, from: &mut Vec<ResourceId>) {
        self.lists[kind.index()].append(from);
    }
}

/// Add `id`'s demand to `out` (the per-kind lists of its parent bus).
fn collect_device(
    tree: &DeviceTree,
    id: DeviceId,
    res: &mut HostBridgeResources,
    out: &mut PerKind,
    options: &EnumerationOptions,
    degrade: DegradeSet,
) {
    let node = tree.node(id);

    if degrade.reject_devices && node.rejectable {
        log::info!("pci: discarding rejectable device {}", node.address());
        return;
    }

    // The function's own BARs decode on the parent bus, bridges
    // included.
    for bar in node.bars() {
        let kind = degrade.effective_kind(bar.kind().resource_kind());
        let leaf = res.arena.alloc(ResourceNode::new(
            kind,
            bar.length(),
            bar.alignment(),
            ResourceUsage::Typical,
            ResourceOwner::Bar {
                device: id,
                index: bar.index(),
            },
        ));
        out.push(kind, leaf);
    }

    if let Some(rom) = node.rom() {
        let leaf = res.arena.alloc(ResourceNode::new(
            ResourceKind::Mem32,
            rom.length,
            rom.align,
            ResourceUsage::OptionRom,
            ResourceOwner::Rom(id),
        ));
        out.push(ResourceKind::Mem32, leaf);
    }

    if !node.is_bridge() {
        return;
    }

    let attributes = node
        .bridge_attributes()
        .expect("bridge node without bridge info");

    let mut below = PerKind::default();
    for child in tree.children(id).iter().copied() {
        collect_device(tree, child, res, &mut below, options, degrade);
    }

    if !degrade.reject_devices {
        if let Some(pads) = options.resource_padding.get(&node.address()) {
            for pad in pads.iter() {
                let kind = degrade.effective_kind(pad.kind);
                let leaf = res.arena.alloc(ResourceNode::new(
                    kind,
                    pad.length,
                    pad.align,
                    ResourceUsage::Padding,
                    ResourceOwner::Bridge(id),
                ));
                below.push(kind, leaf);
            }
        }
    }

    // Degrade-at-merge: a PCI-PCI bridge has no 64-bit window for
    // non-prefetchable memory, and the prefetchable window may be
    // missing or 32-bit only.
    {
        let mut mem64 = below.take(ResourceKind::Mem64);
        below.append(ResourceKind::Mem32, &mut mem64);

        if attributes.contains(BridgeAttributes::NO_PREFETCH_WINDOW) {
            let mut pmem64 = below.take(ResourceKind::PMem64);
            below.append(ResourceKind::Mem32, &mut pmem64);
            let mut pmem32 = below.take(ResourceKind::PMem32);
            below.append(ResourceKind::Mem32, &mut pmem32);
        } else if !attributes.contains(BridgeAttributes::PREFETCH_64) {
            let mut pmem64 = below.take(ResourceKind::PMem64);
            below.append(ResourceKind::PMem32, &mut pmem64);
        }
    }

    // Every bridge carries all five windows, zero-length ones included.
    let mut windows = [None; ResourceKind::COUNT];
    for kind in ResourceKind::ALL {
        let window = res.arena.alloc(ResourceNode::new(
            kind,
            0,
            0,
            ResourceUsage::Typical,
            ResourceOwner::Bridge(id),
        ));
        res.node_mut(window).children = below.take(kind);

        let exclusions = window_exclusions(node.address(), kind, attributes, options);
        calc::calculate(res, window, &exclusions);

        windows[kind.index()] = Some(window);
        out.push(kind, window);
    }

    res.bridge_nodes
        .insert(id, windows.map(|w| w.expect("window missing")));
}

fn window_exclusions(
    address: crate::address::PCIAddress,
    kind: ResourceKind,
    attributes: BridgeAttributes,
    options: &EnumerationOptions,
) -> RangeList {
    let mut list = RangeList::new();

    if kind == ResourceKind::Io {
        if attributes.contains(BridgeAttributes::ISA_FORWARDING) {
            list.insert(0x100, 0x400);
        }
        if attributes.contains(BridgeAttributes::VGA_FORWARDING) {
            list.insert(0x3B0, 0x3BC);
            list.insert(0x3C0, 0x3E0);
        }
    }

    if let Some(records) = options.reserved.get(&address) {
        for record in records.iter().filter(|r| r.kind == kind) {
            list.insert(record.base, record.base + record.length);
        }
    }

    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PCIAddress;
    use crate::config::mock::{MockBar, MockConfigSpace, MockFunction};
    use crate::device::DeviceTree;
    use crate::enumerate::{enumerate_root, BusAllocator};
    use crate::resource::{ResourceUsage, ReservedResourceRecord};
    use crate::session::{EnumerationOptions, ResourcePad};
    use std::prelude::v1::*;

    fn enumerate(mock: &MockConfigSpace, options: &EnumerationOptions) -> DeviceTree {
        let mut tree = DeviceTree::new();
        let mut errors = Vec::new();
        let mut buses = BusAllocator::starting_at(1);
        enumerate_root(mock, &mut tree, options, 0, 0, &mut buses, &mut errors);
        assert!(errors.is_empty());
        tree
    }

    fn build(
        tree: &DeviceTree,
        options: &EnumerationOptions,
        degrade: DegradeSet,
    ) -> HostBridgeResources {
        let roots: Vec<DeviceId> = tree.roots().to_vec();
        build_resources(tree, &roots, HostBridgeHandle(0), options, degrade)
    }

    /// Snapshot of one tree for structural comparison.
    fn shape(res: &HostBridgeResources, kind: ResourceKind) -> Vec<(u64, u64, u64)> {
        res.preorder(kind)
            .iter()
            .map(|id| {
                let n = res.node(*id);
                (n.length(), n.alignment(), n.offset())
            })
            .collect()
    }

    #[test]
    fn every_bridge_has_five_windows() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(&[], (1, 0), MockFunction::bridge(0x8086, 0x2448, 0x00));

        let options = EnumerationOptions::default();
        let tree = enumerate(&mock, &options);
        let res = build(&tree, &options, DegradeSet::default());

        let bridge = tree.lookup(PCIAddress::new(0, 0, 1, 0)).unwrap();
        for kind in ResourceKind::ALL {
            let window = res.bridge_window(bridge, kind).unwrap();
            assert_eq!(window.length(), 0, "{} window of empty bridge", kind);
        }
    }

    #[test]
    fn building_twice_is_idempotent() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(&[], (1, 0), MockFunction::bridge(0x8086, 0x2448, 0x00).pref64());
        mock.add(
            &[(1, 0)],
            (0, 0),
            MockFunction::endpoint(0x10EC, 0x8139, (0x02, 0x00, 0x00))
                .bar(MockBar::mem32(0, 0x1000, false))
                .bar(MockBar::io(1, 0x100))
                .bar(MockBar::mem64(2, 0x10_0000, true)),
        );
        mock.add(
            &[],
            (2, 0),
            MockFunction::endpoint(0x8086, 0x100E, (0x02, 0x00, 0x00))
                .bar(MockBar::mem32(0, 0x4000, false)),
        );

        let options = EnumerationOptions::default();
        let tree = enumerate(&mock, &options);

        let first = build(&tree, &options, DegradeSet::default());
        let second = build(&tree, &options, DegradeSet::default());

        for kind in ResourceKind::ALL {
            assert_eq!(shape(&first, kind), shape(&second, kind), "{} tree", kind);
        }
    }

    #[test]
    fn mem64_degrades_at_merge_under_a_bridge() {
        let mut mock = MockConfigSpace::new(0);
        // prefetchable window is 32-bit only on this bridge
        mock.add(&[], (1, 0), MockFunction::bridge(0x8086, 0x2448, 0x00));
        mock.add(
            &[(1, 0)],
            (0, 0),
            MockFunction::endpoint(0x144D, 0xA808, (0x01, 0x08, 0x02))
                .bar(MockBar::mem64(0, 0x1000, false))
                .bar(MockBar::mem64(2, 0x2000, true)),
        );

        let options = EnumerationOptions::default();
        let tree = enumerate(&mock, &options);
        let res = build(&tree, &options, DegradeSet::default());
        let bridge = tree.lookup(PCIAddress::new(0, 0, 1, 0)).unwrap();

        // non-prefetchable 64-bit demand lands in the Mem32 window
        assert_eq!(
            res.bridge_window(bridge, ResourceKind::Mem32).unwrap().length(),
            0x1000
        );
        assert_eq!(
            res.bridge_window(bridge, ResourceKind::Mem64).unwrap().length(),
            0
        );

        // prefetchable 64-bit demand falls back to PMem32
        assert_eq!(
            res.bridge_window(bridge, ResourceKind::PMem32).unwrap().length(),
            0x2000
        );
        assert_eq!(
            res.bridge_window(bridge, ResourceKind::PMem64).unwrap().length(),
            0
        );

        // the roots aggregate the windows
        assert_eq!(res.root(ResourceKind::Mem32).length(), 0x1000);
        assert_eq!(res.root(ResourceKind::PMem32).length(), 0x2000);
        assert_eq!(res.root(ResourceKind::Mem64).length(), 0);
        assert_eq!(res.root(ResourceKind::PMem64).length(), 0);
    }

    #[test]
    fn missing_prefetch_window_combines_into_mem32() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(
            &[],
            (1, 0),
            MockFunction::bridge(0x8086, 0x2448, 0x00).no_pref_window(),
        );
        mock.add(
            &[(1, 0)],
            (0, 0),
            MockFunction::endpoint(0x10DE, 0x0191, (0x03, 0x00, 0x00))
                .bar(MockBar::mem32(0, 0x1000, true)),
        );

        let options = EnumerationOptions::default();
        let tree = enumerate(&mock, &options);
        let res = build(&tree, &options, DegradeSet::default());
        let bridge = tree.lookup(PCIAddress::new(0, 0, 1, 0)).unwrap();

        assert_eq!(
            res.bridge_window(bridge, ResourceKind::Mem32).unwrap().length(),
            0x1000
        );
        assert_eq!(
            res.bridge_window(bridge, ResourceKind::PMem32).unwrap().length(),
            0
        );
    }

    #[test]
    fn padding_and_reserved_records_shape_the_window() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(&[], (1, 0), MockFunction::bridge(0x8086, 0x2448, 0x00));
        mock.add(
            &[(1, 0)],
            (0, 0),
            MockFunction::endpoint(0x10EC, 0x8139, (0x02, 0x00, 0x00))
                .bar(MockBar::mem32(0, 0x1000, false)),
        );

        let bridge_addr = PCIAddress::new(0, 0, 1, 0);
        let mut options = EnumerationOptions::default();
        options.resource_padding.insert(
            bridge_addr,
            vec![ResourcePad {
                kind: ResourceKind::Mem32,
                length: 0x2000,
                align: 0x1FFF,
            }],
        );
        options.reserved.insert(
            bridge_addr,
            vec![ReservedResourceRecord {
                kind: ResourceKind::Mem32,
                base: 0,
                length: 0x1000,
            }],
        );

        let tree = enumerate(&mock, &options);
        let res = build(&tree, &options, DegradeSet::default());
        let bridge = tree.lookup(bridge_addr).unwrap();

        let window = res.bridge_window(bridge, ResourceKind::Mem32).unwrap();
        // reserved [0, 0x1000) pushes everything up: pad at 0x2000,
        // BAR at 0x4000
        assert_eq!(window.length(), 0x6000);

        let children = window.children().to_vec();
        let usages: Vec<ResourceUsage> = children
            .iter()
            .map(|id| res.node(*id).usage())
            .collect();
        assert!(usages.contains(&ResourceUsage::Padding));

        for id in children {
            let node = res.node(id);
            assert!(node.offset() >= 0x1000, "child inside reserved range");
        }

        // padding disappears when devices are being rejected
        let degraded = build(
            &tree,
            &options,
            DegradeSet {
                reject_devices: true,
                ..DegradeSet::default()
            },
        );
        let window = degraded.bridge_window(bridge, ResourceKind::Mem32).unwrap();
        let has_padding = window
            .children()
            .iter()
            .any(|id| degraded.node(*id).usage() == ResourceUsage::Padding);
        assert!(!has_padding);
    }
}
