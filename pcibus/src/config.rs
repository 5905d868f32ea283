//! Configuration-space access.
//!
//! All probing and programming goes through the [`ConfigAccess`] trait;
//! the engine never touches hardware directly. Two mechanisms ship with
//! the crate ([`ecam`] and, on x86_64, [`port_cam`]); anything else can
//! be supplied by the caller.

pub mod ecam;
#[cfg(target_arch = "x86_64")]
pub mod port_cam;

#[cfg(test)]
pub(crate) mod mock;

use core::fmt;
use core::fmt::Display;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::address::PCIAddress;

/// Dword-aligned configuration register offsets.
pub mod regs {
    /// Vendor id (low word) / device id (high word).
    pub const VENDOR_DEVICE: u16 = 0x00;
    /// Command (low word) / status (high word).
    pub const COMMAND_STATUS: u16 = 0x04;
    /// Revision (byte 0), prog-if / subclass / class (bytes 1-3).
    pub const CLASS_REVISION: u16 = 0x08;
    /// Cache line size / latency / header type / BIST.
    pub const HEADER: u16 = 0x0C;
    /// First base address register; type 0 headers have six,
    /// type 1 headers two.
    pub const BAR0: u16 = 0x10;
    /// Primary / secondary / subordinate bus numbers (type 1).
    pub const BUS_NUMBERS: u16 = 0x18;
    /// I/O base / limit (type 1, low byte each) + secondary status.
    pub const IO_WINDOW: u16 = 0x1C;
    /// Memory base / limit (type 1).
    pub const MEMORY_WINDOW: u16 = 0x20;
    /// Prefetchable memory base / limit (type 1).
    pub const PREFETCH_WINDOW: u16 = 0x24;
    /// Upper 32 bits of the prefetchable base (type 1).
    pub const PREFETCH_BASE_UPPER: u16 = 0x28;
    /// Upper 32 bits of the prefetchable limit (type 1).
    pub const PREFETCH_LIMIT_UPPER: u16 = 0x2C;
    /// Upper 16 bits of the I/O base / limit (type 1).
    pub const IO_WINDOW_UPPER: u16 = 0x30;
    /// Expansion ROM base address (type 0).
    pub const EXPANSION_ROM: u16 = 0x30;
    /// Expansion ROM base address (type 1).
    pub const BRIDGE_EXPANSION_ROM: u16 = 0x38;
    /// Interrupt line / pin + bridge control (type 1, high word).
    pub const BRIDGE_CONTROL: u16 = 0x3C;
}

/// Errors from a configuration mechanism.
///
/// During probing every error is treated as "function absent"; during
/// programming errors are logged and the pass continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// No mechanism covers the given address (wrong segment, bus
    /// outside every window, ...).
    BadAddress(PCIAddress),
    /// The access itself failed.
    Failed(PCIAddress),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadAddress(addr) => {
                write!(f, "no configuration mechanism covers {}", addr)
            }
            ConfigError::Failed(addr) => write!(f, "configuration access to {} failed", addr),
        }
    }
}

/// Dword-granular configuration space access for one or more segments.
pub trait ConfigAccess {
    fn read(&self, address: PCIAddress, offset: u16) -> Result<u32, ConfigError>;
    fn write(&self, address: PCIAddress, offset: u16, value: u32) -> Result<(), ConfigError>;
}

/// Header layout of a function, from the low 7 bits of the header-type
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum HeaderKind {
    Device = 0x00,
    PciBridge = 0x01,
    CardBusBridge = 0x02,
}

bitflags! {
    /// Command register bits written during resource programming.
    pub struct CommandFlags: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const VGA_PALETTE_SNOOP = 1 << 5;
        const SERR_ENABLE = 1 << 8;
    }
}

bitflags! {
    /// Bridge control register bits (high word of `regs::BRIDGE_CONTROL`).
    pub struct BridgeControl: u16 {
        const PARITY_ERROR_RESPONSE = 1 << 0;
        const SERR_ENABLE = 1 << 1;
        const ISA_ENABLE = 1 << 2;
        const VGA_ENABLE = 1 << 3;
        const VGA_16BIT_DECODE = 1 << 4;
        const MASTER_ABORT_MODE = 1 << 5;
        const SECONDARY_RESET = 1 << 6;
    }
}

pub fn read_dev_vendor_id(
    cfg: &dyn ConfigAccess,
    address: PCIAddress,
) -> Result<(u16, u16), ConfigError> {
    let data = cfg.read(address, regs::VENDOR_DEVICE)?;
    let vendor_id = (data & 0xFFFF) as u16;
    let device_id = ((data >> 16) & 0xFFFF) as u16;
    Ok((vendor_id, device_id))
}

/// Whether a function responds at the given address. Read failures are
/// "absent", never propagated.
pub fn device_present(cfg: &dyn ConfigAccess, address: PCIAddress) -> bool {
    match read_dev_vendor_id(cfg, address) {
        Ok((vendor_id, _)) => vendor_id != 0xFFFF && vendor_id != 0x0000,
        Err(_) => false,
    }
}

pub fn is_multi_function(cfg: &dyn ConfigAccess, address: PCIAddress) -> Result<bool, ConfigError> {
    let data = cfg.read(address, regs::HEADER)?;
    let raw_header_type = ((data >> 16) & 0xFF) as u8;

    Ok((raw_header_type & 0x80) != 0)
}

pub fn read_header_kind(
    cfg: &dyn ConfigAccess,
    address: PCIAddress,
) -> Result<Option<HeaderKind>, ConfigError> {
    let data = cfg.read(address, regs::HEADER)?;
    let raw = (((data >> 16) & 0xFF) as u8) & 0x7F;

    Ok(HeaderKind::try_from(raw).ok())
}

/// (major class, minor class, prog-if).
pub fn read_class(
    cfg: &dyn ConfigAccess,
    address: PCIAddress,
) -> Result<(u8, u8, u8), ConfigError> {
    let data = cfg.read(address, regs::CLASS_REVISION)?;
    let major_class = ((data >> 24) & 0xFF) as u8;
    let minor_class = ((data >> 16) & 0xFF) as u8;
    let prog_if = ((data >> 8) & 0xFF) as u8;

    Ok((major_class, minor_class, prog_if))
}

pub fn read_bridge_control(
    cfg: &dyn ConfigAccess,
    address: PCIAddress,
) -> Result<BridgeControl, ConfigError> {
    let data = cfg.read(address, regs::BRIDGE_CONTROL)?;
    Ok(BridgeControl::from_bits_truncate(
        ((data >> 16) & 0xFFFF) as u16,
    ))
}
