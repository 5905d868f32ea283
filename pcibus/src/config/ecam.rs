//! Enhanced configuration access mechanism (memory-mapped).

use alloc_crate::vec::Vec;

use super::{ConfigAccess, ConfigError};
use crate::address::PCIAddress;

/// One mapped ECAM window covering a range of buses in one segment.
#[derive(Debug, Clone, Copy)]
pub struct EcamWindow {
    pub segment: u16,
    pub bus_start: u8,
    pub bus_end: u8,
    /// Virtual address the window is mapped at.
    pub base: usize,
}

impl EcamWindow {
    fn covers(&self, address: PCIAddress) -> bool {
        address.segment() == self.segment
            && address.bus() >= self.bus_start
            && address.bus() <= self.bus_end
    }

    fn register_pointer(&self, address: PCIAddress, offset: u16) -> *mut u32 {
        let byte_offset = address.ecam_offset(self.bus_start) + ((offset & 0xFFC) as u64);
        (self.base + byte_offset as usize) as *mut u32
    }
}

/// Configuration access through one or more ECAM windows.
pub struct EcamConfig {
    windows: Vec<EcamWindow>,
}

impl EcamConfig {
    /// # Safety
    /// Every window's `base` must point to a live mapping of its full
    /// configuration region (`(bus_end - bus_start + 1) << 20` bytes),
    /// and nothing else may access those mappings concurrently.
    pub unsafe fn new(mut windows: Vec<EcamWindow>) -> EcamConfig {
        windows.sort_unstable_by_key(|w| ((w.segment as u32) << 8) | (w.bus_start as u32));
        EcamConfig { windows }
    }

    fn find_window(&self, address: PCIAddress) -> Result<&EcamWindow, ConfigError> {
        self.windows
            .iter()
            .find(|w| w.covers(address))
            .ok_or(ConfigError::BadAddress(address))
    }
}

impl ConfigAccess for EcamConfig {
    fn read(&self, address: PCIAddress, offset: u16) -> Result<u32, ConfigError> {
        assert_eq!(offset & 0x03, 0, "offset {:#06x} not aligned", offset);
        assert!(
            offset < 0x1000,
            "offset {:#06x} too large (limit 0x1000)",
            offset
        );

        let window = self.find_window(address)?;
        // Safety: the window mapping is guaranteed live by `new`'s contract.
        Ok(unsafe { window.register_pointer(address, offset).read_volatile() })
    }

    fn write(&self, address: PCIAddress, offset: u16, value: u32) -> Result<(), ConfigError> {
        assert_eq!(offset & 0x03, 0, "offset {:#06x} not aligned", offset);
        assert!(
            offset < 0x1000,
            "offset {:#06x} too large (limit 0x1000)",
            offset
        );

        let window = self.find_window(address)?;
        // Safety: as above.
        unsafe { window.register_pointer(address, offset).write_volatile(value) };
        Ok(())
    }
}

// The raw window pointers are plain MMIO; the accessor itself holds no
// thread affinity.
unsafe impl Send for EcamConfig {}
unsafe impl Sync for EcamConfig {}
