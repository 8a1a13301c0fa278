//! IP prefix type with specificity comparison and martian classification.

use crate::ParseError;
use crate::family::Family;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// How one prefix relates to another.
///
/// Returned by [`IpPrefix::relation`]: `MoreSpecific` means `self` is
/// strictly contained in `other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefixRelation {
    Equal,
    MoreSpecific,
    LessSpecific,
    Disjoint,
}

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// The length is kernel-native: at most 32 for IPv4, 128 for IPv6. Host
/// bits beyond the length are kept as given; comparisons only look at the
/// covered bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = Family::of(&address).max_prefix_len();
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len, max_len
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    /// The full-length host prefix for an address (/32 or /128).
    pub const fn host(address: IpAddr) -> Self {
        IpPrefix {
            prefix_len: Family::of(&address).max_prefix_len(),
            address,
        }
    }

    /// Returns the address of this prefix as given.
    pub const fn address(&self) -> &IpAddr {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn family(&self) -> Family {
        Family::of(&self.address)
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub const fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// The prefix with host bits cleared.
    pub fn network(&self) -> Self {
        let address = match self.address {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_v4(self.prefix_len))),
            IpAddr::V6(v6) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_v6(self.prefix_len)))
            }
        };
        IpPrefix {
            address,
            prefix_len: self.prefix_len,
        }
    }

    /// Four-way specificity comparison of `self` against `other`.
    ///
    /// Prefixes of different families are always disjoint. Otherwise the
    /// first `min(len)` bits decide containment and the lengths decide the
    /// direction.
    pub fn relation(&self, other: &IpPrefix) -> PrefixRelation {
        let plen = self.prefix_len.min(other.prefix_len);
        let same_bits = match (self.address, other.address) {
            (IpAddr::V4(a), IpAddr::V4(b)) => {
                let mask = mask_v4(plen);
                u32::from(a) & mask == u32::from(b) & mask
            }
            (IpAddr::V6(a), IpAddr::V6(b)) => {
                let mask = mask_v6(plen);
                u128::from(a) & mask == u128::from(b) & mask
            }
            _ => false,
        };

        if !same_bits {
            return PrefixRelation::Disjoint;
        }
        match self.prefix_len.cmp(&other.prefix_len) {
            std::cmp::Ordering::Less => PrefixRelation::LessSpecific,
            std::cmp::Ordering::Greater => PrefixRelation::MoreSpecific,
            std::cmp::Ordering::Equal => PrefixRelation::Equal,
        }
    }

    /// Returns true for ranges that must never be routed: IPv6 multicast
    /// (ff00::/8), link-local (fe80::/10), the unspecified and loopback
    /// host addresses; IPv4 0.0.0.0/8, 127.0.0.0/8 and the class D/E space
    /// (224.0.0.0/3).
    ///
    /// A prefix only counts as martian once it is long enough to lie
    /// entirely inside one of those ranges, so `::/0` is not martian.
    pub fn is_martian(&self) -> bool {
        let plen = self.prefix_len;
        match self.address {
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                (plen >= 8 && octets[0] == 0xff)
                    || (plen >= 10 && octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80)
                    || (plen >= 128 && (v6.is_unspecified() || v6.is_loopback()))
            }
            IpAddr::V4(v4) => {
                let first = v4.octets()[0];
                (plen >= 8 && (first == 127 || first == 0)) || (plen >= 4 && (first & 0xe0) == 0xe0)
            }
        }
    }

    /// Returns true for IPv6 link-local prefixes (fe80::/10).
    pub fn is_link_local(&self) -> bool {
        match self.address {
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            IpAddr::V4(_) => false,
        }
    }
}

fn mask_v4(plen: u8) -> u32 {
    if plen == 0 { 0 } else { u32::MAX << (32 - u32::from(plen)) }
}

fn mask_v6(plen: u8) -> u128 {
    if plen == 0 { 0 } else { u128::MAX << (128 - u32::from(plen)) }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}
