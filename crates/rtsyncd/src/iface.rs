//! Interface name and index resolution

use crate::error::{Result, RtsyncError};
use std::collections::HashMap;
use tracing::trace;

/// Interface name cache, filled from the system on first lookup
#[derive(Debug, Default)]
pub struct InterfaceCache {
    by_index: HashMap<u32, String>,
}

impl InterfaceCache {
    /// Look up interface name by index
    pub fn get(&self, ifindex: u32) -> Option<&str> {
        self.by_index.get(&ifindex).map(|s| s.as_str())
    }

    /// Add interface to cache
    pub fn insert(&mut self, ifindex: u32, name: impl Into<String>) {
        self.by_index.insert(ifindex, name.into());
    }

    /// Resolve interface name, querying system if not cached
    pub fn resolve(&mut self, ifindex: u32) -> Result<&str> {
        if !self.by_index.contains_key(&ifindex) {
            let name = index_to_name(ifindex)?;
            trace!(ifindex, %name, "Resolved interface name");
            self.by_index.insert(ifindex, name);
        }
        self.get(ifindex)
            .ok_or_else(|| RtsyncError::InterfaceNotFound(ifindex.to_string()))
    }
}

/// Kernel index of the interface called `name`.
pub fn name_to_index(name: &str) -> Result<u32> {
    nix::net::if_::if_nametoindex(name)
        .map_err(|e| RtsyncError::InterfaceNotFound(format!("{}: {}", name, e)))
}

/// Name of the interface with kernel index `ifindex`.
pub fn index_to_name(ifindex: u32) -> Result<String> {
    nix::net::if_::if_indextoname(ifindex)
        .map(|name| name.to_string_lossy().into_owned())
        .map_err(|e| RtsyncError::InterfaceNotFound(format!("index {}: {}", ifindex, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = InterfaceCache::default();
        cache.insert(7, "eth7");
        assert_eq!(cache.get(7), Some("eth7"));
        assert_eq!(cache.resolve(7).unwrap(), "eth7");
        assert_eq!(cache.get(8), None);
    }

    #[test]
    fn test_unknown_name() {
        assert!(matches!(
            name_to_index("no-such-if0"),
            Err(RtsyncError::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_index() {
        let mut cache = InterfaceCache::default();
        assert!(cache.resolve(u32::MAX - 1).is_err());
    }
}
