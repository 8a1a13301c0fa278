//! Address primitives shared by the rtsync crates.
//!
//! This crate provides the small set of network types the kernel
//! synchronization layer reasons about:
//!
//! - [`Family`]: IPv4 / IPv6 address family
//! - [`IpPrefix`]: an address plus prefix length, with the four-way
//!   specificity comparison ([`PrefixRelation`]) used to order policy rules
//!   and the martian classification used to filter kernel dumps
//!
//! Prefix lengths are always kernel-native: at most 32 for IPv4.

mod family;
mod ip;

pub use family::Family;
pub use ip::{IpPrefix, PrefixRelation};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),
}
