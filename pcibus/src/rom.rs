//! Expansion ROM sizing.
//!
//! ROM demand is folded into the 32-bit memory tree (as
//! [`ResourceUsage::OptionRom`](crate::resource::ResourceUsage) nodes)
//! before allocation, so option ROMs get address space even though
//! image loading itself happens elsewhere.

use crate::config::{regs, ConfigAccess, ConfigError};
use crate::device::{DeviceTree, RomBar};

const ROM_ADDRESS_MASK: u32 = 0xFFFF_F800;

/// Probe the expansion ROM BAR of every enumerated function.
///
/// Probe failures leave the device without ROM demand; they are never
/// fatal.
pub(crate) fn size_roms(cfg: &dyn ConfigAccess, tree: &mut DeviceTree) {
    for id in tree.preorder_all() {
        let address = tree.node(id).address();
        let offset = if tree.node(id).is_bridge() {
            regs::BRIDGE_EXPANSION_ROM
        } else {
            regs::EXPANSION_ROM
        };

        match probe_rom(cfg, address, offset) {
            Ok(Some(length)) => {
                log::debug!("pci: {} expansion ROM {:#x} bytes", address, length);
                tree.node_mut(id).rom = Some(RomBar {
                    offset,
                    length,
                    align: length - 1,
                });
            }
            Ok(None) => {}
            Err(_) => {
                log::debug!("pci: {} expansion ROM probe failed", address);
            }
        }
    }
}

/// Write-ones probe of one ROM BAR; the enable bit is left clear and
/// the original value restored.
fn probe_rom(
    cfg: &dyn ConfigAccess,
    address: crate::address::PCIAddress,
    offset: u16,
) -> Result<Option<u64>, ConfigError> {
    let original = cfg.read(address, offset)?;

    cfg.write(address, offset, ROM_ADDRESS_MASK)?;
    let probed = cfg.read(address, offset)?;
    cfg.write(address, offset, original)?;

    let mask = probed & ROM_ADDRESS_MASK;
    if mask == 0 {
        return Ok(None);
    }

    Ok(Some(((!mask).wrapping_add(1)) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PCIAddress;
    use crate::config::mock::{MockConfigSpace, MockFunction};
    use crate::device::probe_function;
    use std::prelude::v1::*;

    #[test]
    fn sizes_and_restores_rom_bar() {
        let mut mock = MockConfigSpace::new(0);
        mock.add(
            &[],
            (0, 0),
            MockFunction::endpoint(0x10DE, 0x0191, (0x03, 0x00, 0x00)).rom(0x1_0000),
        );
        mock.add(
            &[],
            (1, 0),
            MockFunction::endpoint(0x8086, 0x100E, (0x02, 0x00, 0x00)),
        );

        let mut tree = DeviceTree::new();
        for device in 0..2 {
            let addr = PCIAddress::new(0, 0, device, 0);
            let node = probe_function(&mock, addr).unwrap().unwrap();
            tree.insert(node, None);
        }

        size_roms(&mock, &mut tree);

        let with_rom = tree.get(PCIAddress::new(0, 0, 0, 0)).unwrap();
        assert_eq!(with_rom.rom().unwrap().length(), 0x1_0000);

        let without = tree.get(PCIAddress::new(0, 0, 1, 0)).unwrap();
        assert!(without.rom().is_none());

        // probe must leave the register as it found it
        assert_eq!(
            mock.register(PCIAddress::new(0, 0, 0, 0), regs::EXPANSION_ROM),
            Some(0)
        );
    }
}
