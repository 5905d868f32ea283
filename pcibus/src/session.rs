//! One enumeration pass, start to finish.
//!
//! The session owns every piece of mutable state a pass touches (the
//! device tree, the per-host-bridge resource trees, the options), so
//! two passes can never share a node and nothing lives in globals.

use alloc_crate::vec::Vec;

use hashbrown::HashMap;

use crate::address::PCIAddress;
use crate::authority::{AllocationPhase, HostBridgeHandle, ResourceAuthority};
use crate::config::ConfigAccess;
use crate::device::{DeviceId, DeviceTree};
use crate::enumerate::{self, BusAllocator, TopologyError};
use crate::error::EnumerationError;
use crate::program::{self, ProgramError};
use crate::resource::{
    DegradeSet, HostBridgeResources, ReservedResourceRecord, ResourceAperture, ResourceKind,
    ResourceOwner,
};
use crate::rom;
use crate::submit::{self, AllocationError, DegradePolicy};

/// Extra window demand reserved beneath a hot-pluggable bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePad {
    pub kind: ResourceKind,
    pub length: u64,
    pub align: u64,
}

/// Per-pass configuration. Everything is keyed by address, so options
/// can be prepared before the pass runs.
pub struct EnumerationOptions {
    pub degrade_policy: DegradePolicy,
    /// Extra bus numbers reserved beneath a bridge.
    pub bus_padding: HashMap<PCIAddress, u8>,
    /// Extra window space reserved beneath a bridge.
    pub resource_padding: HashMap<PCIAddress, Vec<ResourcePad>>,
    /// Platform ranges the calculator must pack around.
    pub reserved: HashMap<PCIAddress, Vec<ReservedResourceRecord>>,
    /// Devices that may be discarded when the platform stays short.
    pub rejectable: Vec<PCIAddress>,
    /// Fold expansion ROM demand into the 32-bit memory trees.
    pub size_roms: bool,
}

impl Default for EnumerationOptions {
    fn default() -> EnumerationOptions {
        EnumerationOptions {
            degrade_policy: DegradePolicy::default(),
            bus_padding: HashMap::new(),
            resource_padding: HashMap::new(),
            reserved: HashMap::new(),
            rejectable: Vec::new(),
            size_roms: true,
        }
    }
}

/// One host bridge the caller wants enumerated.
#[derive(Debug, Clone, Copy)]
pub struct RootBridge {
    pub handle: HostBridgeHandle,
    pub segment: u16,
    pub bus: u8,
}

/// Outcome for one successfully configured host bridge.
pub struct BridgeReport {
    pub handle: HostBridgeHandle,
    pub apertures: Vec<ResourceAperture>,
    pub degrade: DegradeSet,
}

/// Everything a pass has to say about itself.
pub struct EnumerationReport {
    pub topology_errors: Vec<TopologyError>,
    pub configured: Vec<BridgeReport>,
    pub failed_bridges: Vec<(HostBridgeHandle, AllocationError)>,
    pub program_errors: Vec<ProgramError>,
    /// (root bus, subordinate bus) consumed beneath each host bridge.
    pub bus_ranges: Vec<(HostBridgeHandle, u8, u8)>,
    /// Submission rounds the negotiation needed.
    pub attempts: usize,
}

/// A programmed BAR, for the device-path export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarAssignment {
    pub index: u8,
    pub kind: ResourceKind,
    pub base: u64,
    pub length: u64,
}

pub struct EnumerationSession<'a> {
    cfg: &'a dyn ConfigAccess,
    options: EnumerationOptions,
    tree: DeviceTree,
    resources: Vec<HostBridgeResources>,
}

impl<'a> EnumerationSession<'a> {
    pub fn new(cfg: &'a dyn ConfigAccess, options: EnumerationOptions) -> EnumerationSession<'a> {
        EnumerationSession {
            cfg,
            options,
            tree: DeviceTree::new(),
            resources: Vec::new(),
        }
    }

    /// Run the whole pass: bus allocation, ROM sizing, resource-tree
    /// construction, negotiation with the authority, and programming.
    ///
    /// Per-subtree and per-bridge failures land in the report; only a
    /// protocol failure of the authority aborts.
    pub fn run(
        &mut self,
        roots: &[RootBridge],
        authority: &mut dyn ResourceAuthority,
    ) -> Result<EnumerationReport, EnumerationError> {
        if roots.is_empty() {
            return Err(EnumerationError::NoRootBridges);
        }

        let mut topology_errors = Vec::new();

        authority.notify_phase(AllocationPhase::BeginBusAllocation)?;

        // One number space per segment, starting past the highest root
        // bus, keeps assignments globally unique.
        let mut next_bus: HashMap<u16, u16> = HashMap::new();
        for root in roots.iter() {
            let entry = next_bus.entry(root.segment).or_insert(0);
            *entry = (*entry).max(root.bus as u16 + 1);
        }
        let mut allocators: HashMap<u16, BusAllocator> = next_bus
            .into_iter()
            .map(|(segment, next)| (segment, BusAllocator::starting_at(next)))
            .collect();

        let mut bus_ranges = Vec::with_capacity(roots.len());
        for root in roots.iter() {
            let buses = allocators
                .get_mut(&root.segment)
                .expect("allocator missing for segment");

            let subordinate = enumerate::enumerate_root(
                self.cfg,
                &mut self.tree,
                &self.options,
                root.segment,
                root.bus,
                buses,
                &mut topology_errors,
            );
            bus_ranges.push((root.handle, root.bus, subordinate));
        }

        authority.notify_phase(AllocationPhase::EndBusAllocation)?;

        if self.options.size_roms {
            rom::size_roms(self.cfg, &mut self.tree);
        }

        let rejectable: Vec<DeviceId> = self
            .options
            .rejectable
            .iter()
            .filter_map(|address| self.tree.lookup(*address))
            .collect();
        for id in rejectable {
            self.tree.node_mut(id).rejectable = true;
        }

        // Top-level functions grouped under their host bridge, in
        // discovery order.
        let groups: Vec<(HostBridgeHandle, Vec<DeviceId>)> = roots
            .iter()
            .map(|root| {
                let members = self
                    .tree
                    .roots()
                    .iter()
                    .copied()
                    .filter(|id| {
                        let address = self.tree.node(*id).address();
                        address.segment() == root.segment && address.bus() == root.bus
                    })
                    .collect();
                (root.handle, members)
            })
            .collect();

        let outcome = submit::negotiate(authority, &self.tree, &groups, &self.options)?;

        authority.notify_phase(AllocationPhase::SetResources)?;

        let mut program_errors = Vec::new();
        let mut configured = Vec::new();
        self.resources.clear();

        for mut bridge in outcome.configured {
            program_errors.extend(program::program(
                self.cfg,
                &self.tree,
                &mut bridge.resources,
                &bridge.apertures,
            ));

            configured.push(BridgeReport {
                handle: bridge.handle,
                apertures: bridge.apertures,
                degrade: bridge.degrade,
            });
            self.resources.push(bridge.resources);
        }

        authority.notify_phase(AllocationPhase::EndEnumeration)?;

        log::info!(
            "pci: pass complete: {} devices, {} bridges configured, {} failed",
            self.tree.len(),
            configured.len(),
            outcome.failed.len()
        );

        Ok(EnumerationReport {
            topology_errors,
            configured,
            failed_bridges: outcome.failed,
            program_errors,
            bus_ranges,
            attempts: outcome.attempts,
        })
    }

    pub fn device_tree(&self) -> &DeviceTree {
        &self.tree
    }

    pub fn resources(&self) -> &[HostBridgeResources] {
        &self.resources
    }

    pub fn resources_for(&self, handle: HostBridgeHandle) -> Option<&HostBridgeResources> {
        self.resources.iter().find(|r| r.handle() == handle)
    }

    /// Programmed BARs of one device, ascending by BAR index.
    pub fn bar_assignments(&self, address: PCIAddress) -> Vec<BarAssignment> {
        let id = match self.tree.lookup(address) {
            Some(id) => id,
            None => return Vec::new(),
        };

        let mut out = Vec::new();
        for res in self.resources.iter() {
            for kind in ResourceKind::ALL {
                for node_id in res.preorder(kind) {
                    let node = res.node(node_id);
                    if let ResourceOwner::Bar { device, index } = node.owner() {
                        if device == id {
                            if let Some(base) = node.assigned_base() {
                                out.push(BarAssignment {
                                    index,
                                    kind: node.kind(),
                                    base,
                                    length: node.length(),
                                });
                            }
                        }
                    }
                }
            }
        }

        out.sort_by_key(|a| a.index);
        out
    }
}
