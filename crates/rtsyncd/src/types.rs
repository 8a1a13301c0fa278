//! Type definitions for rtsyncd

use crate::error::{Result, RtsyncError};
use rtsync_types::{Family, IpPrefix};
use std::fmt;
use std::net::IpAddr;
use std::ops::{BitOr, BitOrAssign};

/// Metric at or above which a route is unreachable.
pub const KERNEL_INFINITY: u32 = 0xFFFF;

/// Where a route record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteOrigin {
    /// Kernel route protocol tag (RTPROT_*)
    Protocol(u8),
    /// Synthesized from an interface address
    LocalAddress,
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteOrigin::Protocol(p) => write!(f, "proto {}", p),
            RouteOrigin::LocalAddress => f.write_str("local"),
        }
    }
}

/// A route as installed into or read back from the kernel.
///
/// Records are built per request or per dump entry and handed to the
/// caller; nothing here keeps them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteRecord {
    pub dest: IpPrefix,
    /// Only meaningful with source-specific routing
    pub src: Option<IpPrefix>,
    pub gateway: IpAddr,
    pub ifindex: u32,
    pub metric: u32,
    pub origin: RouteOrigin,
}

impl RouteRecord {
    /// A reachable route with no source constraint.
    pub fn new(dest: IpPrefix, gateway: IpAddr, ifindex: u32, metric: u32) -> Self {
        Self {
            dest,
            src: None,
            gateway: gateway.to_canonical(),
            ifindex,
            metric,
            origin: RouteOrigin::Protocol(0),
        }
    }

    /// An unreachable route for `dest`.
    pub fn unreachable(dest: IpPrefix) -> Self {
        Self {
            dest,
            src: None,
            gateway: dest.family().unspecified(),
            ifindex: 0,
            metric: KERNEL_INFINITY,
            origin: RouteOrigin::Protocol(0),
        }
    }

    pub fn with_source(mut self, src: IpPrefix) -> Self {
        self.src = Some(src);
        self
    }

    pub fn with_origin(mut self, origin: RouteOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn family(&self) -> Family {
        self.dest.family()
    }

    pub fn is_unreachable(&self) -> bool {
        self.metric >= KERNEL_INFINITY
    }

    /// Unreachable default routes are never installed nor reported.
    pub fn is_unreachable_default(&self) -> bool {
        self.is_unreachable() && self.dest.is_default()
    }

    /// A source prefix of length zero constrains nothing.
    pub fn source(&self) -> Option<&IpPrefix> {
        self.src.as_ref().filter(|s| !s.is_default())
    }

    /// Destination, source and (for reachable routes) gateway must share a family.
    pub fn check_family(&self) -> Result<()> {
        let expected = self.family();
        if let Some(src) = &self.src {
            if src.family() != expected {
                return Err(RtsyncError::FamilyMismatch {
                    what: "source",
                    expected,
                    found: src.family(),
                });
            }
        }
        let gateway = Family::of(&self.gateway.to_canonical());
        if !self.is_unreachable() && gateway != expected {
            return Err(RtsyncError::FamilyMismatch {
                what: "gateway",
                expected,
                found: gateway,
            });
        }
        Ok(())
    }

    /// Same next hop, interface and metric.
    pub fn same_forwarding(&self, other: &RouteRecord) -> bool {
        self.gateway.to_canonical() == other.gateway.to_canonical()
            && self.ifindex == other.ifindex
            && self.metric == other.metric
    }
}

impl fmt::Display for RouteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dest)?;
        if let Some(src) = &self.src {
            write!(f, " from {}", src)?;
        }
        if self.is_unreachable() {
            write!(f, " unreachable")?;
        } else {
            write!(f, " via {} dev {}", self.gateway, self.ifindex)?;
        }
        write!(f, " metric {} ({})", self.metric, self.origin)
    }
}

/// Route mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

/// Kinds of kernel state touched by one batch of notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChangeMask(u8);

impl ChangeMask {
    pub const ROUTE: ChangeMask = ChangeMask(1 << 0);
    pub const LINK: ChangeMask = ChangeMask(1 << 1);
    pub const ADDRESS: ChangeMask = ChangeMask(1 << 2);
    pub const RULE: ChangeMask = ChangeMask(1 << 3);

    pub const fn empty() -> Self {
        ChangeMask(0)
    }

    pub const fn all() -> Self {
        ChangeMask(Self::ROUTE.0 | Self::LINK.0 | Self::ADDRESS.0 | Self::RULE.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: ChangeMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ChangeMask) {
        self.0 |= other.0;
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for ChangeMask {
    type Output = ChangeMask;

    fn bitor(self, rhs: ChangeMask) -> ChangeMask {
        ChangeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeMask {
    fn bitor_assign(&mut self, rhs: ChangeMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ChangeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (ChangeMask::ROUTE, "route"),
            (ChangeMask::LINK, "link"),
            (ChangeMask::ADDRESS, "address"),
            (ChangeMask::RULE, "rule"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Which interface addresses an address dump reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressFilter {
    /// Restrict to one interface
    pub ifindex: Option<u32>,
    /// Report link-local addresses instead of global ones
    pub link_local: bool,
}

impl AddressFilter {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn link_local(ifindex: u32) -> Self {
        Self {
            ifindex: Some(ifindex),
            link_local: true,
        }
    }
}

/// A policy rule as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRule {
    pub family: Family,
    pub priority: Option<u32>,
    pub src: Option<IpPrefix>,
    pub table: u32,
}

/// An interface address as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub ifindex: u32,
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    /// The address as a host route record.
    pub fn to_record(&self) -> RouteRecord {
        RouteRecord {
            dest: IpPrefix::host(self.address),
            src: None,
            gateway: Family::of(&self.address).unspecified(),
            ifindex: self.ifindex,
            metric: 0,
            origin: RouteOrigin::LocalAddress,
        }
    }
}

/// Route and address dumps fill a caller-sized buffer and report how many
/// entries matched, which may exceed what fit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpResult {
    pub records: Vec<RouteRecord>,
    pub found: usize,
}

impl DumpResult {
    pub fn with_capacity(max: usize) -> Self {
        Self {
            records: Vec::with_capacity(max.min(1024)),
            found: 0,
        }
    }

    /// Count a match and keep it if there is room.
    pub fn push(&mut self, record: RouteRecord, max: usize) {
        if self.records.len() < max {
            self.records.push(record);
        }
        self.found += 1;
    }

    pub fn is_truncated(&self) -> bool {
        self.found > self.records.len()
    }
}
