//! Address family.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP address family of a route, rule or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    /// Both families, in the order the kernel is queried (IPv6 first).
    pub const ALL: [Family; 2] = [Family::Inet6, Family::Inet];

    /// Family of an address.
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Inet,
            IpAddr::V6(_) => Family::Inet6,
        }
    }

    /// Maximum prefix length in bits.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            Family::Inet => 32,
            Family::Inet6 => 128,
        }
    }

    /// The all-zeroes address of this family.
    pub const fn unspecified(&self) -> IpAddr {
        match self {
            Family::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub const fn is_ipv4(&self) -> bool {
        matches!(self, Family::Inet)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Inet => f.write_str("v4"),
            Family::Inet6 => f.write_str("v6"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_family_of_address() {
        assert_eq!(Family::of(&"10.0.0.1".parse().unwrap()), Family::Inet);
        assert_eq!(Family::of(&"fe80::1".parse().unwrap()), Family::Inet6);
    }

    #[test]
    fn test_family_widths() {
        assert_eq!(Family::Inet.max_prefix_len(), 32);
        assert_eq!(Family::Inet6.max_prefix_len(), 128);
    }

    #[test]
    fn test_unspecified_matches_family() {
        assert_eq!(Family::of(&Family::Inet.unspecified()), Family::Inet);
        assert!(Family::Inet6.unspecified().is_unspecified());
    }
}
