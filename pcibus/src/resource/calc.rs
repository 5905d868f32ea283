//! Aperture calculation: packing children into the smallest aligned
//! window that holds them all.

use alloc_crate::vec::Vec;

use pcibus_structures::RangeList;

use super::{HostBridgeResources, ResourceId};

/// Round `value` up to the alignment described by `align_mask`
/// (alignment minus one).
#[inline]
pub(crate) fn align_up(value: u64, align_mask: u64) -> u64 {
    value.wrapping_add(align_mask) & !align_mask
}

/// Compute the window of `node` from its children.
///
/// Children are packed greedily by decreasing alignment; ties keep
/// their declaration (bus/device/function) order. Candidate placements
/// overlapping an excluded range are bumped forward past it and
/// re-aligned, which can leave unused holes inside the aperture. The
/// resulting length is the smallest multiple of the largest child
/// alignment containing every placement, and the children are left
/// sorted in ascending-offset order for the programmer.
pub(crate) fn calculate(res: &mut HostBridgeResources, node: ResourceId, exclusions: &RangeList) {
    let mut children: Vec<ResourceId> = res.node(node).children.clone();
    // sort_by is stable, so equal alignments stay in declaration order
    children.sort_by(|a, b| res.node(*b).align.cmp(&res.node(*a).align));

    let mut max_align: u64 = 0;
    let mut cursor: u64 = 0;

    for child in children.iter().copied() {
        let length = res.node(child).length;
        let align = res.node(child).align;

        if length == 0 {
            res.node_mut(child).offset = cursor;
            continue;
        }

        if align > max_align {
            max_align = align;
        }

        let mut offset = align_up(cursor, align);
        while let Some((_, excluded_end)) = exclusions.first_overlap(offset, offset + length) {
            offset = align_up(excluded_end, align);
        }

        res.node_mut(child).offset = offset;
        cursor = offset + length;
    }

    let mut aperture_align = max_align;
    // excluded legacy ranges are absolute low addresses; pin the
    // aperture to at least 4K alignment so offsets coincide with them
    if !exclusions.is_empty() && cursor > 0 && aperture_align < 0xFFF {
        aperture_align = 0xFFF;
    }

    let length = if cursor == 0 {
        0
    } else {
        align_up(cursor, aperture_align)
    };

    let n = res.node_mut(node);
    n.length = length;
    n.align = aperture_align;
    n.children = children;
}

#[cfg(test)]
mod tests {
    use super::super::{ResourceKind, ResourceNode, ResourceOwner, ResourceUsage};
    use super::*;
    use crate::authority::HostBridgeHandle;
    use crate::resource::HostBridgeResources;
    use std::prelude::v1::*;

    fn demand(res: &mut HostBridgeResources, length: u64, align: u64) -> ResourceId {
        let id = res.arena.alloc(ResourceNode::new(
            ResourceKind::Mem32,
            length,
            align,
            ResourceUsage::Typical,
            ResourceOwner::HostBridge,
        ));
        let root = res.root_id(ResourceKind::Mem32);
        res.node_mut(root).children.push(id);
        id
    }

    #[test]
    fn packs_largest_alignment_first() {
        // three leaves: 0x1000/0xFFF, 0x2000/0x1FFF, 0x1000/0xFFF
        let mut res = HostBridgeResources::new(HostBridgeHandle(0));
        let a = demand(&mut res, 0x1000, 0xFFF);
        let b = demand(&mut res, 0x2000, 0x1FFF);
        let c = demand(&mut res, 0x1000, 0xFFF);

        let root = res.root_id(ResourceKind::Mem32);
        calculate(&mut res, root, &RangeList::new());

        assert_eq!(res.node(root).length(), 0x4000);
        assert_eq!(res.node(root).alignment(), 0x1FFF);

        assert_eq!(res.node(b).offset(), 0x0000);
        assert_eq!(res.node(a).offset(), 0x2000);
        assert_eq!(res.node(c).offset(), 0x3000);

        for id in [a, b, c] {
            let n = res.node(id);
            assert_eq!(n.offset() & n.alignment(), 0);
        }
    }

    #[test]
    fn zero_children_zero_length() {
        let mut res = HostBridgeResources::new(HostBridgeHandle(0));
        let root = res.root_id(ResourceKind::Io);
        calculate(&mut res, root, &RangeList::new());

        assert_eq!(res.node(root).length(), 0);
        assert_eq!(res.node(root).alignment(), 0);
    }

    #[test]
    fn exclusions_split_the_aperture() {
        // I/O demand spanning 0x0-0x4FF around the ISA/VGA holes
        let mut res = HostBridgeResources::new(HostBridgeHandle(0));

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = res.arena.alloc(ResourceNode::new(
                ResourceKind::Io,
                0x100,
                0xFF,
                ResourceUsage::Typical,
                ResourceOwner::HostBridge,
            ));
            let root = res.root_id(ResourceKind::Io);
            res.node_mut(root).children.push(id);
            ids.push(id);
        }

        let mut exclusions = RangeList::new();
        exclusions.insert(0x100, 0x400);
        exclusions.insert(0x3B0, 0x3BC);
        exclusions.insert(0x3C0, 0x3E0);

        let root = res.root_id(ResourceKind::Io);
        calculate(&mut res, root, &exclusions);

        let offsets: Vec<u64> = ids.iter().map(|id| res.node(*id).offset()).collect();
        assert_eq!(offsets, vec![0x000, 0x400, 0x500, 0x600, 0x700]);

        // nothing landed inside an excluded range
        for id in ids.iter() {
            let n = res.node(*id);
            assert!(!exclusions.overlaps(n.offset(), n.offset() + n.length()));
        }

        // exclusions pin the aperture to 4K alignment
        assert_eq!(res.node(root).alignment(), 0xFFF);
        assert_eq!(res.node(root).length(), 0x1000);
    }

    #[quickcheck]
    fn children_never_overlap(lens: Vec<u8>) -> bool {
        let mut res = HostBridgeResources::new(HostBridgeHandle(0));
        let mut ids = Vec::new();

        for len in lens.iter().take(24) {
            // power-of-two lengths from 0x10 to 0x1000
            let length = 0x10u64 << (*len % 9);
            ids.push(demand(&mut res, length, length - 1));
        }

        let root = res.root_id(ResourceKind::Mem32);
        calculate(&mut res, root, &RangeList::new());

        let mut spans: Vec<(u64, u64)> = ids
            .iter()
            .map(|id| (res.node(*id).offset(), res.node(*id).length()))
            .collect();
        spans.sort_unstable();

        let contained = spans
            .iter()
            .all(|(off, len)| off + len <= res.node(root).length());
        let disjoint = spans.windows(2).all(|w| w[0].0 + w[0].1 <= w[1].0);
        let aligned = ids.iter().all(|id| {
            let n = res.node(*id);
            n.offset() & n.alignment() == 0
        });

        contained && disjoint && aligned
    }
}
