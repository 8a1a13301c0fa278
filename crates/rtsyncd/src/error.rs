//! Error types for rtsyncd
//!
//! Failures fall into a few classes that callers treat differently:
//! channel-fatal transport errors close the channel and are reopened on the
//! next operation, transient errors were already retried once, and kernel
//! errors carry the errno reported in the acknowledgement.

use rtsync_types::Family;
use thiserror::Error;

/// Errors that can occur in rtsyncd
#[derive(Debug, Error)]
pub enum RtsyncError {
    /// Channel-fatal netlink failure; the channel has been closed
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Socket would block or was interrupted, after one bounded wait
    #[error("Transient netlink condition: {0}")]
    Transient(String),

    /// Kernel rejected a request (positive errno)
    #[error("Kernel error: errno {code}")]
    Kernel { code: i32 },

    /// Malformed message or attribute
    #[error("Decode error: {0}")]
    Decode(String),

    /// No free slot left in the source table pool
    #[error("Source table pool exhausted ({capacity} tables)")]
    TableCapacity { capacity: usize },

    /// Destination, source and gateway disagree on address family
    #[error("Address family mismatch: {what} is {found}, destination is {expected}")]
    FamilyMismatch {
        what: &'static str,
        expected: Family,
        found: Family,
    },

    /// Interface lookup failed
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A channel was used before setup
    #[error("Netlink channel not initialized")]
    NotInitialized,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address or prefix parse error
    #[error("Parse error: {0}")]
    Parse(#[from] rtsync_types::ParseError),
}

impl RtsyncError {
    /// Build a kernel error from the (negative) code found in an ack.
    pub fn from_ack_code(code: i32) -> Self {
        RtsyncError::Kernel { code: code.saturating_abs() }
    }

    /// Errno carried by a kernel error, if any.
    pub fn kernel_code(&self) -> Option<i32> {
        match self {
            RtsyncError::Kernel { code } => Some(*code),
            _ => None,
        }
    }

    /// The object being added already exists (EEXIST).
    pub fn is_exists(&self) -> bool {
        self.kernel_code() == Some(libc::EEXIST)
    }

    /// The object being removed is absent (ENOENT or ESRCH).
    pub fn is_not_found(&self) -> bool {
        matches!(self.kernel_code(), Some(libc::ENOENT) | Some(libc::ESRCH))
    }

    /// The channel that produced this error was closed.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(self, RtsyncError::Netlink(_))
    }
}

/// Result type alias for rtsyncd operations
pub type Result<T> = std::result::Result<T, RtsyncError>;
