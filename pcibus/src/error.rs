//! Top-level error taxonomy.
//!
//! Probe errors never leave the prober (an unreadable function is an
//! empty slot). Topology and per-bridge allocation failures are
//! collected in the [`EnumerationReport`](crate::session::EnumerationReport)
//! so sibling subtrees and other host bridges proceed; only
//! authority-protocol failures abort a pass.

use core::fmt;
use core::fmt::Display;

use crate::authority::AuthorityError;

pub use crate::config::ConfigError;
pub use crate::enumerate::TopologyError;
pub use crate::program::ProgramError;
pub use crate::submit::AllocationError;

/// Failures that end an enumeration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationError {
    /// The resource authority broke protocol (rejected a phase
    /// notification, lost a submission, returned garbage).
    Authority(AuthorityError),
    /// `run` was called with no root bridges.
    NoRootBridges,
}

impl Display for EnumerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumerationError::Authority(error) => {
                write!(f, "resource authority failed: {}", error)
            }
            EnumerationError::NoRootBridges => write!(f, "no root bridges to enumerate"),
        }
    }
}

impl From<AuthorityError> for EnumerationError {
    fn from(error: AuthorityError) -> EnumerationError {
        EnumerationError::Authority(error)
    }
}
