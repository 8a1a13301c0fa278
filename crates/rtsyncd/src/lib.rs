//! Kernel routing table synchronization
//!
//! The kernel-facing half of a distance-vector routing daemon: it installs,
//! removes and replaces routes over rtnetlink, maps source-specific routes
//! onto dedicated routing tables selected by policy rules, lists routes
//! installed by other protocols and the host's interface addresses, and
//! turns kernel change notifications into a compact change mask.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐    ┌──────────────────────────────┐    ┌────────────┐
//! │  routing daemon  │───▶│  KernelRouting               │    │   kernel   │
//! │                  │    │    TableAllocator (rules)    │    │            │
//! │  ChangeHandler   │◀───│    Transport                 │◀──▶│  rtnetlink │
//! └──────────────────┘    │      command channel (acks)  │    │            │
//!                         │      listen channel (groups) │    └────────────┘
//!                         └──────────────────────────────┘
//! ```
//!
//! Both channels run over the [`netlink::Connector`] seam; [`sim::SimKernel`]
//! plugs in an in-memory kernel for tests and dry runs.

pub mod codec;
pub mod config;
pub mod error;
pub mod iface;
pub mod kernel;
pub mod netlink;
pub mod sim;
pub mod table;
pub mod types;

pub use config::RtsyncConfig;
pub use error::{Result, RtsyncError};
pub use kernel::{ChangeHandler, KernelRouting};
pub use rtsync_types::{Family, IpPrefix, PrefixRelation};
pub use table::{RuleInstaller, TableAllocator};
pub use types::{
    AddressFilter, ChangeMask, DumpResult, KERNEL_INFINITY, RouteOp, RouteOrigin, RouteRecord,
};
