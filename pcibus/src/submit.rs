//! Allocation submission and the degrade/retry adjuster.
//!
//! `Collecting -> Submitted -> {Accepted, Rejected}`: every host
//! bridge's trees are serialized and submitted, the authority decides
//! globally, and on rejection each unsatisfied bridge applies the next
//! step of its degrade policy and the round repeats. The loop is
//! bounded by the policy length; it cannot spin on a persistently
//! rejecting authority.

use alloc_crate::vec::Vec;
use core::fmt;
use core::fmt::Display;

use crate::authority::{AllocationPhase, AuthorityError, HostBridgeHandle, ResourceAuthority};
use crate::descriptor;
use crate::device::{DeviceId, DeviceTree};
use crate::error::EnumerationError;
use crate::resource::build::{self, DegradeSet};
use crate::resource::{HostBridgeResources, ResourceAperture, ResourceKind};
use crate::session::EnumerationOptions;

/// One degrade action, applied at most once per host bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeStep {
    /// Fold 64-bit demand into the matching 32-bit tree.
    DropMem64,
    /// Fold prefetchable demand into the non-prefetchable trees.
    DropPrefetch,
    /// Discard rejectable device subtrees and padding.
    RejectDevices,
}

/// Ordered degrade steps. Folding 64-bit demand first, then
/// prefetchable, then rejecting devices is the default; the order is
/// policy, not structure.
#[derive(Debug, Clone)]
pub struct DegradePolicy {
    steps: Vec<DegradeStep>,
}

impl DegradePolicy {
    pub fn new(steps: &[DegradeStep]) -> DegradePolicy {
        DegradePolicy {
            steps: steps.to_vec(),
        }
    }

    pub fn steps(&self) -> &[DegradeStep] {
        &self.steps
    }
}

impl Default for DegradePolicy {
    fn default() -> DegradePolicy {
        DegradePolicy::new(&[
            DegradeStep::DropMem64,
            DegradeStep::DropPrefetch,
            DegradeStep::RejectDevices,
        ])
    }
}

/// Why a host bridge ended the negotiation unconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// Every degrade step was spent and the authority still said no.
    Exhausted { bridge: HostBridgeHandle },
}

impl Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::Exhausted { bridge } => {
                write!(f, "{} exhausted every degrade step", bridge)
            }
        }
    }
}

/// Adjuster states, in order of appearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Collecting,
    Submitted,
    Accepted,
    Rejected,
}

/// A host bridge that finished negotiation successfully.
pub struct ConfiguredBridge {
    pub handle: HostBridgeHandle,
    pub resources: HostBridgeResources,
    pub apertures: Vec<ResourceAperture>,
    pub degrade: DegradeSet,
}

pub struct NegotiationOutcome {
    pub configured: Vec<ConfiguredBridge>,
    pub failed: Vec<(HostBridgeHandle, AllocationError)>,
    /// Submission rounds used.
    pub attempts: usize,
}

struct PendingBridge {
    handle: HostBridgeHandle,
    roots: Vec<DeviceId>,
    degrade: DegradeSet,
    steps_used: usize,
    resources: HostBridgeResources,
}

impl PendingBridge {
    /// Apply the next unused policy step; false when none remain.
    fn degrade_once(&mut self, policy: &DegradePolicy) -> bool {
        let step = match policy.steps().get(self.steps_used) {
            Some(step) => *step,
            None => return false,
        };
        self.steps_used += 1;

        match step {
            DegradeStep::DropMem64 => self.degrade.fold_mem64 = true,
            DegradeStep::DropPrefetch => self.degrade.fold_prefetch = true,
            DegradeStep::RejectDevices => self.degrade.reject_devices = true,
        }

        log::info!("pci: {} degrading: applying {:?}", self.handle, step);
        true
    }
}

/// Run the full negotiation for every host bridge at once.
pub(crate) fn negotiate(
    authority: &mut dyn ResourceAuthority,
    tree: &DeviceTree,
    bridges: &[(HostBridgeHandle, Vec<DeviceId>)],
    options: &EnumerationOptions,
) -> Result<NegotiationOutcome, EnumerationError> {
    authority.notify_phase(AllocationPhase::BeginResourceAllocation)?;

    let mut pending: Vec<PendingBridge> = bridges
        .iter()
        .map(|(handle, roots)| {
            let degrade = DegradeSet::default();
            PendingBridge {
                handle: *handle,
                roots: roots.clone(),
                degrade,
                steps_used: 0,
                resources: build::build_resources(tree, roots, *handle, options, degrade),
            }
        })
        .collect();

    let mut failed: Vec<(HostBridgeHandle, AllocationError)> = Vec::new();
    let mut attempts = 0usize;
    let mut state = AllocationState::Collecting;

    while !pending.is_empty() && state != AllocationState::Accepted {
        match state {
            AllocationState::Collecting => {
                for bridge in pending.iter() {
                    let bytes = descriptor::serialize_roots(&bridge.resources);
                    authority.submit(bridge.handle, &bytes)?;
                }

                state = AllocationState::Submitted;
            }

            AllocationState::Submitted => {
                attempts += 1;
                authority.notify_phase(AllocationPhase::AllocateResources)?;

                state = match authority.allocate_all() {
                    Ok(()) => AllocationState::Accepted,
                    Err(AuthorityError::Rejected) => {
                        log::warn!("pci: resource allocation rejected (round {})", attempts);
                        AllocationState::Rejected
                    }
                    Err(other) => return Err(EnumerationError::Authority(other)),
                };
            }

            AllocationState::Rejected => {
                // Each rejected round must degrade or fail at least one
                // bridge, which bounds the loop at policy-length steps
                // per bridge. Proposals are read before FreeResources,
                // which invalidates them.
                let mut progressed = false;

                let mut still_pending = Vec::with_capacity(pending.len());
                for mut bridge in pending.drain(..) {
                    let proposed = descriptor::parse(&authority.get_proposed(bridge.handle)?)
                        .map_err(|_| {
                            EnumerationError::Authority(AuthorityError::InvalidDescriptors)
                        })?;

                    let satisfied = proposed.iter().all(|d| d.satisfied());
                    if !satisfied {
                        progressed = true;

                        if !bridge.degrade_once(&options.degrade_policy) {
                            log::error!("pci: {} left unconfigured", bridge.handle);
                            failed.push((
                                bridge.handle,
                                AllocationError::Exhausted {
                                    bridge: bridge.handle,
                                },
                            ));
                            continue;
                        }

                        bridge.resources = build::build_resources(
                            tree,
                            &bridge.roots,
                            bridge.handle,
                            options,
                            bridge.degrade,
                        );
                    }

                    still_pending.push(bridge);
                }

                pending = still_pending;
                authority.notify_phase(AllocationPhase::FreeResources)?;

                if !progressed {
                    // The authority rejects globally while reporting
                    // every per-bridge status satisfied; resubmitting
                    // identical demand cannot converge.
                    log::error!("pci: allocation rejected without an unsatisfied bridge");
                    for bridge in pending.drain(..) {
                        failed.push((
                            bridge.handle,
                            AllocationError::Exhausted {
                                bridge: bridge.handle,
                            },
                        ));
                    }
                }

                state = AllocationState::Collecting;
            }

            AllocationState::Accepted => unreachable!(),
        }
    }

    let mut configured = Vec::with_capacity(pending.len());
    for bridge in pending {
        let proposed = descriptor::parse(&authority.get_proposed(bridge.handle)?)
            .map_err(|_| EnumerationError::Authority(AuthorityError::InvalidDescriptors))?;

        let apertures: Vec<ResourceAperture> = proposed
            .iter()
            .filter(|d| d.satisfied())
            .map(|d| ResourceAperture {
                kind: d.kind,
                base: d.base,
                length: d.length,
            })
            .collect();

        configured.push(ConfiguredBridge {
            handle: bridge.handle,
            resources: bridge.resources,
            apertures,
            degrade: bridge.degrade,
        });
    }

    Ok(NegotiationOutcome {
        configured,
        failed,
        attempts,
    })
}

/// Find the aperture of one kind in a proposal list.
pub(crate) fn aperture_for(
    apertures: &[ResourceAperture],
    kind: ResourceKind,
) -> Option<&ResourceAperture> {
    apertures.iter().find(|a| a.kind == kind)
}
