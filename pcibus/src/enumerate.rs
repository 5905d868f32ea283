//! Device discovery and depth-first bus-number assignment.

use alloc_crate::vec::Vec;
use core::fmt;
use core::fmt::Display;

use crate::address::PCIAddress;
use crate::config::{regs, ConfigAccess, ConfigError};
use crate::device::{probe_function, DeviceId, DeviceTree};
use crate::session::EnumerationOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    /// More than 256 buses were needed beneath this bridge.
    BusNumbersExhausted { bridge: PCIAddress },
    /// The bridge's bus-number registers could not be written; nothing
    /// behind it is reachable.
    MalformedBridge { bridge: PCIAddress },
}

impl Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::BusNumbersExhausted { bridge } => {
                write!(f, "bus numbers exhausted beneath bridge {}", bridge)
            }
            TopologyError::MalformedBridge { bridge } => {
                write!(f, "bridge {} did not accept bus numbers", bridge)
            }
        }
    }
}

/// Monotonic bus-number source, shared by every host bridge of a
/// segment so numbers stay globally unique.
pub(crate) struct BusAllocator {
    next: u16,
}

impl BusAllocator {
    pub(crate) fn starting_at(next: u16) -> BusAllocator {
        BusAllocator { next }
    }

    fn allocate(&mut self) -> Option<u8> {
        if self.next > 0xFF {
            return None;
        }

        let bus = self.next as u8;
        self.next += 1;
        Some(bus)
    }

    /// Reserve `count` extra numbers (for hot-plug headroom), clamped
    /// at the end of the space. Returns the highest reserved number.
    fn reserve(&mut self, count: u8) -> u8 {
        self.next = (self.next + count as u16).min(0x100);
        self.highest_assigned()
    }

    fn highest_assigned(&self) -> u8 {
        debug_assert!(self.next > 0, "no bus numbers assigned yet");
        (self.next - 1).min(0xFF) as u8
    }
}

/// Enumerate everything reachable from one root bus.
///
/// Returns the subordinate (highest) bus number in use below the root
/// once the walk finishes. Probe failures mean "empty slot"; topology
/// failures sever the affected subtree, are recorded in `errors`, and
/// enumeration continues with the siblings.
pub(crate) fn enumerate_root(
    cfg: &dyn ConfigAccess,
    tree: &mut DeviceTree,
    options: &EnumerationOptions,
    segment: u16,
    root_bus: u8,
    buses: &mut BusAllocator,
    errors: &mut Vec<TopologyError>,
) -> u8 {
    log::info!("pci: enumerating bus {:04x}:{:02x}", segment, root_bus);
    scan_bus(cfg, tree, options, segment, root_bus, None, buses, errors);
    buses.highest_assigned().max(root_bus)
}

/// Probe all 32 device slots (8 functions each) of one bus.
#[allow(clippy::too_many_arguments)]
fn scan_bus(
    cfg: &dyn ConfigAccess,
    tree: &mut DeviceTree,
    options: &EnumerationOptions,
    segment: u16,
    bus: u8,
    parent: Option<DeviceId>,
    buses: &mut BusAllocator,
    errors: &mut Vec<TopologyError>,
) {
    for device in 0..32u8 {
        let mut multi_function = false;

        for function in 0..8u8 {
            if function > 0 && !multi_function {
                break;
            }

            let address = PCIAddress::new(segment, bus, device, function);
            let node = match probe_function(cfg, address) {
                Ok(Some(node)) => node,
                // an empty or unreadable function 0 empties the slot
                Ok(None) | Err(_) => {
                    if function == 0 {
                        break;
                    }
                    continue;
                }
            };

            if function == 0 {
                multi_function = node.multi_function;
            }

            log::info!("pci: enumerated device {}", node);
            let id = tree.insert(node, parent);

            if tree.node(id).is_bridge() {
                if let Err(error) = descend_bridge(cfg, tree, options, segment, bus, id, buses, errors)
                {
                    // no partial tree may stay referenced: the failed
                    // bridge and everything below it are severed
                    log::warn!("pci: {}", error);
                    errors.push(error);
                    tree.detach_subtree(id);
                }
            }
        }
    }
}

/// Assign a secondary bus to `bridge`, enumerate beneath it, then
/// close its subordinate range.
#[allow(clippy::too_many_arguments)]
fn descend_bridge(
    cfg: &dyn ConfigAccess,
    tree: &mut DeviceTree,
    options: &EnumerationOptions,
    segment: u16,
    primary_bus: u8,
    bridge: DeviceId,
    buses: &mut BusAllocator,
    errors: &mut Vec<TopologyError>,
) -> Result<(), TopologyError> {
    let address = tree.node(bridge).address();

    let secondary = buses
        .allocate()
        .ok_or(TopologyError::BusNumbersExhausted { bridge: address })?;

    // Open the forwarding range wide while probing below, as the
    // downstream extent is not yet known.
    write_bus_numbers(cfg, address, primary_bus, secondary, 0xFF)
        .map_err(|_| TopologyError::MalformedBridge { bridge: address })?;

    log::debug!("pci: bridge {} secondary bus {:02x}", address, secondary);
    scan_bus(cfg, tree, options, segment, secondary, Some(bridge), buses, errors);

    let mut subordinate = buses.highest_assigned();
    if let Some(padding) = options.bus_padding.get(&address) {
        subordinate = buses.reserve(*padding);
        log::debug!(
            "pci: bridge {} padded to subordinate {:02x}",
            address,
            subordinate
        );
    }

    write_bus_numbers(cfg, address, primary_bus, secondary, subordinate)
        .map_err(|_| TopologyError::MalformedBridge { bridge: address })?;

    let info = tree
        .node_mut(bridge)
        .bridge
        .as_mut()
        .expect("descending into a non-bridge");
    info.secondary_bus = secondary;
    info.subordinate_bus = subordinate;

    Ok(())
}

fn write_bus_numbers(
    cfg: &dyn ConfigAccess,
    address: PCIAddress,
    primary: u8,
    secondary: u8,
    subordinate: u8,
) -> Result<(), ConfigError> {
    let original = cfg.read(address, regs::BUS_NUMBERS)?;
    let value = (original & 0xFF00_0000)
        | ((subordinate as u32) << 16)
        | ((secondary as u32) << 8)
        | (primary as u32);

    cfg.write(address, regs::BUS_NUMBERS, value)
}
