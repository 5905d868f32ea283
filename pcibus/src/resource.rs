//! Address-space demand modelling.
//!
//! Every enumeration pass builds five independent resource trees per
//! host bridge, one per [`ResourceKind`]. Leaf nodes are BAR or ROM
//! demands, interior nodes are bridge windows aggregating their
//! children, and each tree is rooted at a synthetic host-bridge node.

pub mod build;
pub mod calc;

use alloc_crate::vec::Vec;
use core::fmt;
use core::fmt::Display;

use hashbrown::HashMap;
use num_enum::TryFromPrimitive;
use pcibus_structures::{Arena, NodeId};

use crate::authority::HostBridgeHandle;
use crate::device::DeviceId;

pub use build::DegradeSet;

/// The five independent address-space types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum ResourceKind {
    Io = 0,
    Mem32 = 1,
    PMem32 = 2,
    Mem64 = 3,
    PMem64 = 4,
}

impl ResourceKind {
    pub const COUNT: usize = 5;
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Io,
        ResourceKind::Mem32,
        ResourceKind::PMem32,
        ResourceKind::Mem64,
        ResourceKind::PMem64,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_memory(self) -> bool {
        self != ResourceKind::Io
    }

    pub fn is_prefetchable(self) -> bool {
        matches!(self, ResourceKind::PMem32 | ResourceKind::PMem64)
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, ResourceKind::Mem64 | ResourceKind::PMem64)
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Io => "I/O",
            ResourceKind::Mem32 => "Mem32",
            ResourceKind::PMem32 => "PMem32",
            ResourceKind::Mem64 => "Mem64",
            ResourceKind::PMem64 => "PMem64",
        };
        f.write_str(name)
    }
}

/// Why a node demands space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUsage {
    /// Ordinary device or window demand.
    Typical,
    /// Reserved headroom beneath a hot-pluggable bridge.
    Padding,
    /// Expansion ROM reservation.
    OptionRom,
}

/// What a resource node describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOwner {
    /// The synthetic root of one tree.
    HostBridge,
    /// A bridge's aggregated window.
    Bridge(DeviceId),
    /// One BAR of a leaf function.
    Bar { device: DeviceId, index: u8 },
    /// A device's expansion ROM.
    Rom(DeviceId),
}

pub type ResourceId = NodeId<ResourceNode>;

/// One demand for address space.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub(crate) kind: ResourceKind,
    pub(crate) length: u64,
    /// Alignment mask: alignment minus one, always a power of two
    /// minus one.
    pub(crate) align: u64,
    pub(crate) usage: ResourceUsage,
    pub(crate) owner: ResourceOwner,
    /// Non-empty only for bridge and host-bridge nodes, kept in
    /// ascending-offset (programming) order once calculated.
    pub(crate) children: Vec<ResourceId>,
    /// Offset relative to the parent's aperture base, assigned by the
    /// calculator.
    pub(crate) offset: u64,
    /// Absolute base written by the programmer.
    pub(crate) assigned: Option<u64>,
}

impl ResourceNode {
    pub(crate) fn new(
        kind: ResourceKind,
        length: u64,
        align: u64,
        usage: ResourceUsage,
        owner: ResourceOwner,
    ) -> ResourceNode {
        debug_assert!(
            align.wrapping_add(1).is_power_of_two() || align == 0,
            "alignment mask {:#x} is not a power of two minus one",
            align
        );

        ResourceNode {
            kind,
            length,
            align,
            usage,
            owner,
            children: Vec::new(),
            offset: 0,
            assigned: None,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn alignment(&self) -> u64 {
        self.align
    }

    pub fn usage(&self) -> ResourceUsage {
        self.usage
    }

    pub fn owner(&self) -> ResourceOwner {
        self.owner
    }

    pub fn children(&self) -> &[ResourceId] {
        &self.children
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn assigned_base(&self) -> Option<u64> {
        self.assigned
    }
}

/// Base address granted by the resource authority for one tree root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAperture {
    pub kind: ResourceKind,
    pub base: u64,
    pub length: u64,
}

/// Platform-mandated range that must stay unallocated beneath a
/// bridge; offsets are relative to the bridge's aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedResourceRecord {
    pub kind: ResourceKind,
    pub base: u64,
    pub length: u64,
}

/// The five resource trees of one host bridge, sharing one arena.
pub struct HostBridgeResources {
    pub(crate) handle: HostBridgeHandle,
    pub(crate) arena: Arena<ResourceNode>,
    pub(crate) roots: [ResourceId; ResourceKind::COUNT],
    /// Window nodes per bridge device, for window programming.
    pub(crate) bridge_nodes: HashMap<DeviceId, [ResourceId; ResourceKind::COUNT]>,
}

impl HostBridgeResources {
    pub(crate) fn new(handle: HostBridgeHandle) -> HostBridgeResources {
        let mut arena = Arena::new();
        let roots = ResourceKind::ALL.map(|kind| {
            arena.alloc(ResourceNode::new(
                kind,
                0,
                0,
                ResourceUsage::Typical,
                ResourceOwner::HostBridge,
            ))
        });

        HostBridgeResources {
            handle,
            arena,
            roots,
            bridge_nodes: HashMap::new(),
        }
    }

    pub fn handle(&self) -> HostBridgeHandle {
        self.handle
    }

    pub fn root_id(&self, kind: ResourceKind) -> ResourceId {
        self.roots[kind.index()]
    }

    pub fn root(&self, kind: ResourceKind) -> &ResourceNode {
        &self.arena[self.root_id(kind)]
    }

    pub fn node(&self, id: ResourceId) -> &ResourceNode {
        &self.arena[id]
    }

    pub(crate) fn node_mut(&mut self, id: ResourceId) -> &mut ResourceNode {
        &mut self.arena[id]
    }

    pub fn bridge_window(&self, device: DeviceId, kind: ResourceKind) -> Option<&ResourceNode> {
        self.bridge_nodes
            .get(&device)
            .map(|ids| &self.arena[ids[kind.index()]])
    }

    /// Every node in one tree, parents before children.
    pub fn preorder(&self, kind: ResourceKind) -> Vec<ResourceId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root_id(kind)];

        while let Some(id) = stack.pop() {
            out.push(id);
            for child in self.arena[id].children.iter().rev() {
                stack.push(*child);
            }
        }

        out
    }
}
