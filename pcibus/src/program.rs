//! Writing negotiated bases into BARs and bridge windows.
//!
//! Pre-order, per resource type: every child is placed at its parent's
//! base plus its calculated offset, so siblings are written in strictly
//! increasing address order and a bridge's window is final before
//! anything beneath it is touched. Writes are verified by read-back; a
//! mismatch is logged and programming continues.

use alloc_crate::vec::Vec;

use hashbrown::HashMap;

use crate::address::PCIAddress;
use crate::config::{regs, CommandFlags, ConfigAccess};
use crate::device::{BarKind, BridgeAttributes, DeviceId, DeviceTree};
use crate::resource::{
    HostBridgeResources, ResourceAperture, ResourceId, ResourceKind, ResourceOwner,
};
use crate::submit;

use core::fmt;
use core::fmt::Display;

/// A register that did not retain the value written to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramError {
    pub address: PCIAddress,
    pub kind: ResourceKind,
    pub offset: u16,
    pub expected: u32,
    pub found: u32,
}

impl Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} register {:#04x} ({}) readback {:#010x} != {:#010x}",
            self.address, self.offset, self.kind, self.found, self.expected
        )
    }
}

struct Programmer<'a> {
    cfg: &'a dyn ConfigAccess,
    tree: &'a DeviceTree,
    errors: Vec<ProgramError>,
    /// Decode enables owed to each device, written last.
    enables: HashMap<DeviceId, CommandFlags>,
}

/// Program every BAR and window of one host bridge from its accepted
/// apertures. Best-effort: failures are reported, not fatal.
pub(crate) fn program(
    cfg: &dyn ConfigAccess,
    tree: &DeviceTree,
    res: &mut HostBridgeResources,
    apertures: &[ResourceAperture],
) -> Vec<ProgramError> {
    let mut programmer = Programmer {
        cfg,
        tree,
        errors: Vec::new(),
        enables: HashMap::new(),
    };

    for kind in ResourceKind::ALL {
        let root = res.root_id(kind);
        let base = match submit::aperture_for(apertures, kind) {
            Some(aperture) => aperture.base,
            None => {
                // Nothing granted for this type: every window beneath
                // is zero-length and gets programmed disabled.
                debug_assert_eq!(res.node(root).length(), 0);
                0
            }
        };

        programmer.walk(res, root, base);
    }

    programmer.write_enables();
    programmer.errors
}

impl Programmer<'_> {
    fn walk(&mut self, res: &mut HostBridgeResources, node: ResourceId, base: u64) {
        res.node_mut(node).assigned = Some(base);

        let children = res.node(node).children.clone();
        for child in children {
            let absolute = base + res.node(child).offset;
            let kind = res.node(child).kind;
            let length = res.node(child).length;
            let owner = res.node(child).owner;

            match owner {
                ResourceOwner::Bar { device, index } => {
                    res.node_mut(child).assigned = Some(absolute);
                    self.program_bar(device, index, kind, absolute);
                }
                ResourceOwner::Rom(device) => {
                    res.node_mut(child).assigned = Some(absolute);
                    self.program_rom(device, absolute);
                }
                ResourceOwner::Bridge(device) => {
                    // Both prefetchable trees share one window register;
                    // whichever carries the demand owns it, and it must
                    // not be clobbered by the empty sibling's disable.
                    let skip_window = match kind {
                        ResourceKind::PMem64 => length == 0,
                        ResourceKind::PMem32 => {
                            length == 0
                                && res
                                    .bridge_window(device, ResourceKind::PMem64)
                                    .map_or(false, |w| w.length() > 0)
                        }
                        _ => false,
                    };

                    if !skip_window {
                        self.program_window(device, kind, absolute, length);
                    }
                    self.walk(res, child, absolute);
                }
                ResourceOwner::HostBridge => {
                    // roots are walked from `program`, never as children
                    unreachable!("host bridge node as a child");
                }
            }
        }
    }

    /// Write a register and read it back; record a mismatch under
    /// `verify_mask`.
    fn write_verified(
        &mut self,
        address: PCIAddress,
        offset: u16,
        value: u32,
        verify_mask: u32,
        kind: ResourceKind,
    ) {
        if self.cfg.write(address, offset, value).is_err() {
            log::warn!(
                "pci: {} register {:#04x} write failed",
                address,
                offset
            );
            return;
        }

        let found = match self.cfg.read(address, offset) {
            Ok(found) => found,
            Err(_) => {
                log::warn!("pci: {} register {:#04x} readback failed", address, offset);
                return;
            }
        };

        if (found & verify_mask) != (value & verify_mask) {
            let error = ProgramError {
                address,
                kind,
                offset,
                expected: value & verify_mask,
                found: found & verify_mask,
            };
            log::warn!("pci: programming mismatch: {}", error);
            self.errors.push(error);
        }
    }

    fn program_bar(&mut self, device: DeviceId, index: u8, kind: ResourceKind, base: u64) {
        let node = self.tree.node(device);
        let address = node.address();
        let offset = regs::BAR0 + 4 * (index as u16);

        let verify_mask = if kind == ResourceKind::Io {
            0xFFFF_FFFC
        } else {
            0xFFFF_FFF0
        };

        // The register keeps its hardware width even when the demand
        // was degraded into a 32-bit tree, so the upper dword of a
        // 64-bit BAR must still be written.
        let wide = node
            .bars()
            .iter()
            .find(|b| b.index() == index)
            .map_or(false, |b| matches!(b.kind(), BarKind::Mem64 { .. }));

        self.write_verified(address, offset, base as u32, verify_mask, kind);
        if wide {
            self.write_verified(address, offset + 4, (base >> 32) as u32, 0xFFFF_FFFF, kind);
        }

        *self.enables.entry(device).or_insert(CommandFlags::empty()) |= if kind == ResourceKind::Io
        {
            CommandFlags::IO_SPACE
        } else {
            CommandFlags::MEMORY_SPACE
        };

        log::debug!(
            "pci: {} BAR #{} ({}) at {:#x}",
            address,
            index,
            kind,
            base
        );
    }

    fn program_rom(&mut self, device: DeviceId, base: u64) {
        let node = self.tree.node(device);
        let address = node.address();
        let offset = match node.rom() {
            Some(rom) => rom.offset,
            None => return,
        };

        // enable bit stays clear until a driver actually maps the ROM
        self.write_verified(
            address,
            offset,
            (base as u32) & 0xFFFF_F800,
            0xFFFF_F800,
            ResourceKind::Mem32,
        );

        *self.enables.entry(device).or_insert(CommandFlags::empty()) |= CommandFlags::MEMORY_SPACE;
    }

    fn program_window(&mut self, device: DeviceId, kind: ResourceKind, base: u64, length: u64) {
        let node = self.tree.node(device);
        let address = node.address();

        let enabled = length > 0;
        let limit = if enabled { base + length - 1 } else { 0 };

        match kind {
            ResourceKind::Io => {
                // base/limit nibbles hold address bits 15:12; an empty
                // window is disabled by making base exceed limit
                let (base_field, limit_field) = if enabled {
                    (((base >> 8) as u32) & 0xF0, ((limit >> 8) as u32) & 0xF0)
                } else {
                    (0xF0, 0x00)
                };

                self.write_verified(
                    address,
                    regs::IO_WINDOW,
                    (limit_field << 8) | base_field,
                    0x0000_F0F0,
                    kind,
                );
                self.write_verified(
                    address,
                    regs::IO_WINDOW_UPPER,
                    if enabled {
                        ((limit as u32) & 0xFFFF_0000) | ((base as u32) >> 16)
                    } else {
                        0
                    },
                    0xFFFF_FFFF,
                    kind,
                );
            }

            ResourceKind::Mem32 => {
                let value = if enabled {
                    (((limit as u32) >> 16) & 0xFFF0) << 16 | (((base as u32) >> 16) & 0xFFF0)
                } else {
                    0x0000_FFF0
                };

                self.write_verified(address, regs::MEMORY_WINDOW, value, 0xFFF0_FFF0, kind);
            }

            ResourceKind::PMem32 | ResourceKind::PMem64 => {
                // a bridge without a prefetchable window has nothing to
                // disable, and its registers would fail verification
                let missing = node
                    .bridge_attributes()
                    .map_or(false, |a| a.contains(BridgeAttributes::NO_PREFETCH_WINDOW));
                if !enabled && missing {
                    return;
                }

                let value = if enabled {
                    (((limit as u32) >> 16) & 0xFFF0) << 16 | (((base as u32) >> 16) & 0xFFF0)
                } else {
                    0x0000_FFF0
                };

                self.write_verified(address, regs::PREFETCH_WINDOW, value, 0xFFF0_FFF0, kind);
                self.write_verified(
                    address,
                    regs::PREFETCH_BASE_UPPER,
                    if enabled { (base >> 32) as u32 } else { 0 },
                    0xFFFF_FFFF,
                    kind,
                );
                self.write_verified(
                    address,
                    regs::PREFETCH_LIMIT_UPPER,
                    if enabled { (limit >> 32) as u32 } else { 0 },
                    0xFFFF_FFFF,
                    kind,
                );
            }

            // a PCI-PCI bridge has no non-prefetchable 64-bit window;
            // that demand was folded away at merge time
            ResourceKind::Mem64 => {
                debug_assert!(!enabled, "Mem64 window on a bridge");
            }
        }

        if enabled {
            let flags = if kind == ResourceKind::Io {
                CommandFlags::IO_SPACE
            } else {
                CommandFlags::MEMORY_SPACE
            };

            *self.enables.entry(device).or_insert(CommandFlags::empty()) |=
                flags | CommandFlags::BUS_MASTER;

            log::debug!(
                "pci: {} {} window {:#x}-{:#x}",
                address,
                kind,
                base,
                limit
            );
        }
    }

    /// Turn on decode for every device that received resources,
    /// parents before children.
    fn write_enables(&mut self) {
        for id in self.tree.preorder_all() {
            let flags = match self.enables.get(&id) {
                Some(flags) => *flags,
                None => continue,
            };

            let address = self.tree.node(id).address();
            let original = match self.cfg.read(address, regs::COMMAND_STATUS) {
                Ok(value) => value,
                Err(_) => {
                    log::warn!("pci: {} command register read failed", address);
                    continue;
                }
            };

            let value = (original & 0xFFFF_0000) | ((original as u16) | flags.bits()) as u32;
            if self.cfg.write(address, regs::COMMAND_STATUS, value).is_err() {
                log::warn!("pci: {} command register write failed", address);
            }
        }
    }
}
