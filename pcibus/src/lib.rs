//! PCI bus enumeration and resource allocation.
//!
//! This crate discovers every function on a PCI bus hierarchy by probing
//! configuration space, assigns bus numbers to bridges, computes the
//! address-space demand of every BAR and bridge window, negotiates
//! address assignments with a platform resource authority, and finally
//! programs BARs and bridge apertures so that every device is
//! addressable before drivers attach.
//!
//! The engine is hardware-agnostic: configuration access and the
//! platform's address-space bookkeeping are supplied by the caller
//! through the [`ConfigAccess`](config::ConfigAccess) and
//! [`ResourceAuthority`](authority::ResourceAuthority) traits. A full
//! pass is driven by [`EnumerationSession::run`](session::EnumerationSession::run).

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc as alloc_crate;

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

pub mod address;
pub mod authority;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod enumerate;
pub mod error;
pub mod program;
pub mod resource;
pub mod rom;
pub mod session;
pub mod submit;

pub use address::PCIAddress;
pub use authority::{AllocationPhase, AuthorityError, HostBridgeHandle, ResourceAuthority};
pub use config::{ConfigAccess, ConfigError};
pub use error::EnumerationError;
pub use resource::{ResourceAperture, ResourceKind, ResourceUsage};
pub use session::{EnumerationOptions, EnumerationReport, EnumerationSession, RootBridge};
pub use submit::{DegradePolicy, DegradeStep};
