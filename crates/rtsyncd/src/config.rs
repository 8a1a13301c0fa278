//! Configuration file support for rtsyncd
//!
//! Loads and validates rtsyncd configuration from TOML files.
//! Default location: /etc/rtsync/rtsyncd.conf

use crate::error::{Result, RtsyncError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rtsync/rtsyncd.conf";

/// Kernel routing tables used for export and import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablesConfig {
    /// Table receiving routes that need no source rule
    #[serde(default = "default_export_table")]
    pub export_table: u32,

    /// Tables whose foreign routes are reported by dumps
    #[serde(default = "default_import_tables")]
    pub import_tables: Vec<u32>,
}

/// Source-specific routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Route by source prefix through policy rules
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Kernel accepts RTA_SRC on IPv6 routes natively
    #[serde(default)]
    pub ipv6_subtrees: bool,

    /// First kernel table number of the pool
    #[serde(default = "default_table_base")]
    pub table_base: u32,

    /// Rule priority of slot 0
    #[serde(default = "default_priority_base")]
    pub priority_base: u32,

    /// Number of source tables
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// Netlink socket behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetlinkConfig {
    /// Protocol tag stamped on installed routes
    #[serde(default = "default_protocol")]
    pub protocol: u8,

    /// SO_RCVBUF for the listen channel
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Bounded wait before retrying a would-block read or write
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,

    /// Upper bound on rule flushes per mismatched priority
    #[serde(default = "default_max_flush_attempts")]
    pub max_flush_attempts: usize,
}

/// Complete rtsyncd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtsyncConfig {
    #[serde(default)]
    pub tables: TablesConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub netlink: NetlinkConfig,
}

// Default functions
fn default_true() -> bool {
    true
}

fn default_export_table() -> u32 {
    254
}

fn default_import_tables() -> Vec<u32> {
    vec![254]
}

fn default_table_base() -> u32 {
    10
}

fn default_priority_base() -> u32 {
    100
}

fn default_capacity() -> usize {
    10
}

fn default_protocol() -> u8 {
    42
}

fn default_recv_buffer_size() -> usize {
    32 * 1024
}

fn default_wait_timeout() -> u64 {
    100
}

fn default_max_flush_attempts() -> usize {
    16
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            export_table: default_export_table(),
            import_tables: default_import_tables(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ipv6_subtrees: false,
            table_base: default_table_base(),
            priority_base: default_priority_base(),
            capacity: default_capacity(),
        }
    }
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            recv_buffer_size: default_recv_buffer_size(),
            wait_timeout_ms: default_wait_timeout(),
            max_flush_attempts: default_max_flush_attempts(),
        }
    }
}

impl RtsyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                RtsyncError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RtsyncError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RtsyncError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path.as_ref(), content)?;

        Ok(())
    }

    /// Get the transport wait timeout as Duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.netlink.wait_timeout_ms)
    }

    /// Kernel table numbers owned by the source table pool
    pub fn source_table_range(&self) -> std::ops::Range<u64> {
        let base = u64::from(self.source.table_base);
        base..base + self.source.capacity as u64
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tables.import_tables.is_empty() {
            return Err(RtsyncError::Config(
                "import_tables must name at least one table".to_string(),
            ));
        }

        if self.netlink.protocol == 0 {
            return Err(RtsyncError::Config(
                "protocol must not be 0 (unspecified)".to_string(),
            ));
        }

        if self.netlink.wait_timeout_ms == 0 {
            return Err(RtsyncError::Config(
                "wait_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.netlink.recv_buffer_size < 4096 {
            return Err(RtsyncError::Config(
                "recv_buffer_size must be at least 4096".to_string(),
            ));
        }

        if self.netlink.max_flush_attempts == 0 {
            return Err(RtsyncError::Config(
                "max_flush_attempts must be > 0".to_string(),
            ));
        }

        if !(1..=64).contains(&self.source.capacity) {
            return Err(RtsyncError::Config(
                "source capacity must be 1-64".to_string(),
            ));
        }

        let tables = self.source_table_range();
        if tables.end > u64::from(u32::MAX) + 1 {
            return Err(RtsyncError::Config(
                "source table range exceeds the kernel table space".to_string(),
            ));
        }
        let priorities = u64::from(self.source.priority_base) + self.source.capacity as u64;
        if priorities > u64::from(u32::MAX) + 1 {
            return Err(RtsyncError::Config(
                "source rule priorities exceed the kernel priority space".to_string(),
            ));
        }

        let overlaps = std::iter::once(&self.tables.export_table)
            .chain(&self.tables.import_tables)
            .find(|t| tables.contains(&u64::from(**t)));
        if let Some(table) = overlaps {
            return Err(RtsyncError::Config(format!(
                "table {} is both an export/import table and in the source table pool",
                table
            )));
        }

        Ok(())
    }
}
