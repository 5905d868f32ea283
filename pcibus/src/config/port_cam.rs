//! Legacy configuration access mechanism (ports 0xCF8/0xCFC).

use spin::Mutex;
use x86_64::instructions::port::Port;

use super::{ConfigAccess, ConfigError};
use crate::address::PCIAddress;

/// Port-based configuration access for segment 0.
///
/// The address/data port pair is a single shared resource, so the
/// two-step access sequence runs under a lock.
pub struct PortCamConfig(Mutex<()>);

impl PortCamConfig {
    pub const fn new() -> PortCamConfig {
        PortCamConfig(Mutex::new(()))
    }
}

impl Default for PortCamConfig {
    fn default() -> PortCamConfig {
        PortCamConfig::new()
    }
}

impl ConfigAccess for PortCamConfig {
    fn read(&self, address: PCIAddress, offset: u16) -> Result<u32, ConfigError> {
        assert_eq!(offset & 0x03, 0, "offset {:#06x} not aligned", offset);

        if address.segment() != 0 || offset >= 0x100 {
            return Err(ConfigError::BadAddress(address));
        }

        let _lock = self.0.lock();
        let mut address_port: Port<u32> = Port::new(0xCF8);
        let mut data_port: Port<u32> = Port::new(0xCFC);

        // Safety: 0xCF8/0xCFC is the architectural config address/data
        // pair; the lock serializes the two-step sequence.
        unsafe {
            address_port.write(address.legacy_cam_address(offset));
            Ok(data_port.read())
        }
    }

    fn write(&self, address: PCIAddress, offset: u16, value: u32) -> Result<(), ConfigError> {
        assert_eq!(offset & 0x03, 0, "offset {:#06x} not aligned", offset);

        if address.segment() != 0 || offset >= 0x100 {
            return Err(ConfigError::BadAddress(address));
        }

        let _lock = self.0.lock();
        let mut address_port: Port<u32> = Port::new(0xCF8);
        let mut data_port: Port<u32> = Port::new(0xCFC);

        // Safety: as above.
        unsafe {
            address_port.write(address.legacy_cam_address(offset));
            data_port.write(value);
        }

        Ok(())
    }
}
