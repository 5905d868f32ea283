//! The host-bridge resource authority contract.
//!
//! The platform owns the global address-space bookkeeping; the engine
//! submits per-type demands through this trait, asks for one global
//! allocation, and reads back proposed bases. [`RangeAuthority`] is a
//! self-contained implementation over caller-described address windows,
//! used by hosted tests and platforms without firmware bookkeeping.

use alloc_crate::vec::Vec;
use core::fmt;
use core::fmt::Display;

use hashbrown::HashMap;
use pcibus_structures::RangeList;

use crate::descriptor::{
    self, ResourceDescriptor, STATUS_NOT_SATISFIED, STATUS_SATISFIED,
};
use crate::resource::ResourceKind;

/// Opaque identity of one host bridge, assigned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostBridgeHandle(pub u32);

impl Display for HostBridgeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host bridge {}", self.0)
    }
}

/// Lifecycle markers delivered to the authority, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPhase {
    BeginBusAllocation,
    EndBusAllocation,
    BeginResourceAllocation,
    AllocateResources,
    SetResources,
    FreeResources,
    EndEnumeration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityError {
    /// The submitted demands could not all be satisfied; per-type
    /// statuses are available through `get_proposed`.
    Rejected,
    UnknownBridge(HostBridgeHandle),
    InvalidDescriptors,
}

impl Display for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityError::Rejected => write!(f, "resource request rejected"),
            AuthorityError::UnknownBridge(handle) => write!(f, "unknown {}", handle),
            AuthorityError::InvalidDescriptors => write!(f, "malformed resource descriptors"),
        }
    }
}

/// The platform side of resource negotiation.
///
/// The engine holds a one-pending-request-at-a-time contract per host
/// bridge: `submit` replaces any previous submission, `allocate_all` is
/// called once after every bridge has submitted, and `get_proposed`
/// reads back the outcome.
pub trait ResourceAuthority {
    fn notify_phase(&mut self, phase: AllocationPhase) -> Result<(), AuthorityError>;

    /// Hand over one bridge's demands as a descriptor stream
    /// (see [`descriptor`](crate::descriptor)).
    fn submit(
        &mut self,
        bridge: HostBridgeHandle,
        descriptors: &[u8],
    ) -> Result<(), AuthorityError>;

    /// Try to satisfy every submitted bridge at once.
    fn allocate_all(&mut self) -> Result<(), AuthorityError>;

    /// Read back the proposal for one bridge: the submitted stream with
    /// bases and satisfaction statuses filled in.
    fn get_proposed(&self, bridge: HostBridgeHandle) -> Result<Vec<u8>, AuthorityError>;
}

struct AuthorityBridge {
    windows: [RangeList; ResourceKind::COUNT],
    submitted: Vec<ResourceDescriptor>,
    proposed: Vec<ResourceDescriptor>,
}

/// Reference authority: first-fit carve-out from fixed per-type
/// address windows.
pub struct RangeAuthority {
    bridges: HashMap<HostBridgeHandle, AuthorityBridge>,
}

impl RangeAuthority {
    pub fn new() -> RangeAuthority {
        RangeAuthority {
            bridges: HashMap::new(),
        }
    }

    /// Register a host bridge and the address windows it may hand out,
    /// as `(kind, base, end)` half-open ranges.
    pub fn add_bridge(&mut self, handle: HostBridgeHandle, windows: &[(ResourceKind, u64, u64)]) {
        let mut lists: [RangeList; ResourceKind::COUNT] = Default::default();
        for (kind, base, end) in windows.iter().copied() {
            lists[kind.index()].insert(base, end);
        }

        self.bridges.insert(
            handle,
            AuthorityBridge {
                windows: lists,
                submitted: Vec::new(),
                proposed: Vec::new(),
            },
        );
    }

    fn place(windows: &mut RangeList, length: u64, align: u64) -> Option<u64> {
        let mut found = None;
        for (start, end) in windows.iter() {
            let base = crate::resource::calc::align_up(start, align);
            if base + length <= end {
                found = Some(base);
                break;
            }
        }

        if let Some(base) = found {
            windows.remove(base, base + length);
        }

        found
    }
}

impl Default for RangeAuthority {
    fn default() -> RangeAuthority {
        RangeAuthority::new()
    }
}

impl ResourceAuthority for RangeAuthority {
    fn notify_phase(&mut self, phase: AllocationPhase) -> Result<(), AuthorityError> {
        log::debug!("pci: authority phase {:?}", phase);

        if phase == AllocationPhase::FreeResources {
            // the pool is handed back: pending submissions and
            // proposals from the failed round are both void
            for bridge in self.bridges.values_mut() {
                bridge.submitted.clear();
                bridge.proposed.clear();
            }
        }

        Ok(())
    }

    fn submit(
        &mut self,
        bridge: HostBridgeHandle,
        descriptors: &[u8],
    ) -> Result<(), AuthorityError> {
        let parsed =
            descriptor::parse(descriptors).map_err(|_| AuthorityError::InvalidDescriptors)?;

        let state = self
            .bridges
            .get_mut(&bridge)
            .ok_or(AuthorityError::UnknownBridge(bridge))?;

        state.submitted = parsed;
        Ok(())
    }

    fn allocate_all(&mut self) -> Result<(), AuthorityError> {
        let mut all_satisfied = true;

        for state in self.bridges.values_mut() {
            // Carve from a scratch copy so a rejected round leaves the
            // windows untouched for the resubmission.
            let mut scratch = state.windows.clone();
            state.proposed.clear();

            for desc in state.submitted.iter() {
                let mut proposed = *desc;

                match Self::place(&mut scratch[desc.kind.index()], desc.length, desc.align) {
                    Some(base) => {
                        proposed.base = base;
                        proposed.status = STATUS_SATISFIED;
                    }
                    None => {
                        proposed.status = STATUS_NOT_SATISFIED;
                        all_satisfied = false;
                    }
                }

                state.proposed.push(proposed);
            }
        }

        if all_satisfied {
            Ok(())
        } else {
            Err(AuthorityError::Rejected)
        }
    }

    fn get_proposed(&self, bridge: HostBridgeHandle) -> Result<Vec<u8>, AuthorityError> {
        let state = self
            .bridges
            .get(&bridge)
            .ok_or(AuthorityError::UnknownBridge(bridge))?;

        let mut out = Vec::new();
        descriptor::serialize(&state.proposed, &mut out);
        Ok(out)
    }
}
