//! WolfSync Configuration
//!
//! This module provides configuration structures for the WolfSync
//! state replication engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::tuning::TunedConfig;
use crate::wire::{SchemaVersion, DIGEST_LEN, MIN_PACKET, SUBHEADER_LEN};

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WolfSyncConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Replication protocol configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Creator id stamped on locally created states (random if unset)
    #[serde(default)]
    pub host_id: Option<u32>,

    /// Identifier of the loaded ruleset. Peers sharing it keep the
    /// rule numbers of imported states.
    #[serde(default = "default_ruleset")]
    pub ruleset: String,
}

/// Replication protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local address to bind the sync socket
    #[serde(default = "default_sync_address")]
    pub bind_address: String,

    /// Unicast peer; multicast is used when unset
    #[serde(default)]
    pub peer: Option<String>,

    /// Multicast group joined when no peer is configured
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,

    /// Address of the interface used for multicast
    #[serde(default)]
    pub interface: Option<Ipv4Addr>,

    /// Insert/Update record layout used for sending
    #[serde(default)]
    pub schema_version: SchemaVersion,

    /// Largest datagram the engine will build
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Compressed updates of a TCP state before a full update is forced
    #[serde(default = "default_max_updates")]
    pub max_updates: u32,

    /// Hold packets that create states until the peer acknowledges them
    #[serde(default)]
    pub defer: bool,

    /// How long a held packet waits for an acknowledgment
    #[serde(default = "default_defer_timeout_ms")]
    pub defer_timeout_ms: u64,

    /// Held packets per bucket before the oldest is released
    #[serde(default = "default_defer_limit")]
    pub defer_limit: usize,

    /// Number of buckets (0 = auto-detect from CPU count)
    #[serde(default)]
    pub buckets: usize,

    /// Idle time after which a partly filled datagram is sent
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Wait for a bulk transfer to start before asking again
    #[serde(default = "default_bulk_retry_ms")]
    pub bulk_retry_ms: u64,

    /// Bulk requests sent before assuming the peer has nothing to send
    #[serde(default = "default_bulk_max_tries")]
    pub bulk_max_tries: u32,

    /// Base wait for the end of a started bulk transfer
    #[serde(default = "default_bulk_start_grace_ms")]
    pub bulk_start_grace_ms: u64,

    /// Minimum spacing of re-announcements triggered by stale peer updates
    #[serde(default = "default_reannounce_holdoff_ms")]
    pub reannounce_holdoff_ms: u64,

    /// Capacity of the outbound channel feeding the transmit task
    /// (0 = auto-detect from the bucket count)
    #[serde(default)]
    pub send_queue_len: usize,

    /// Demotion applied while the state table is not synchronized
    #[serde(default = "default_failover_demote")]
    pub failover_demote: i32,

    /// Maximum number of states in the local table (0 = unlimited)
    #[serde(default)]
    pub state_limit: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_ruleset() -> String {
    "default".to_string()
}

fn default_sync_address() -> String {
    "0.0.0.0:8240".to_string()
}

fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(224, 0, 0, 240)
}

fn default_mtu() -> usize {
    1472
}

fn default_max_updates() -> u32 {
    128
}

fn default_defer_timeout_ms() -> u64 {
    20
}

fn default_defer_limit() -> usize {
    128
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_bulk_retry_ms() -> u64 {
    5000
}

fn default_bulk_max_tries() -> u32 {
    12
}

fn default_bulk_start_grace_ms() -> u64 {
    4000
}

fn default_reannounce_holdoff_ms() -> u64 {
    1000
}

fn default_failover_demote() -> i32 {
    240
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8241".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host_id: None,
            ruleset: default_ruleset(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_address: default_sync_address(),
            peer: None,
            multicast_group: default_multicast_group(),
            interface: None,
            schema_version: SchemaVersion::default(),
            mtu: default_mtu(),
            max_updates: default_max_updates(),
            defer: false,
            defer_timeout_ms: default_defer_timeout_ms(),
            defer_limit: default_defer_limit(),
            buckets: 0,
            flush_interval_ms: default_flush_interval_ms(),
            bulk_retry_ms: default_bulk_retry_ms(),
            bulk_max_tries: default_bulk_max_tries(),
            bulk_start_grace_ms: default_bulk_start_grace_ms(),
            reannounce_holdoff_ms: default_reannounce_holdoff_ms(),
            send_queue_len: 0,
            failover_demote: default_failover_demote(),
            state_limit: 0,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SyncConfig {
    /// Smallest MTU that still fits one full state record of either layout
    pub fn min_mtu() -> usize {
        MIN_PACKET + SUBHEADER_LEN + SchemaVersion::V2.state_len()
    }

    /// Validate the protocol settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.mtu < Self::min_mtu() || self.mtu > u16::MAX as usize {
            return Err(crate::Error::Config(format!(
                "sync.mtu must be between {} and {}",
                Self::min_mtu(),
                u16::MAX
            )));
        }

        if self.max_updates == 0 {
            return Err(crate::Error::Config("sync.max_updates must be at least 1".into()));
        }

        if self.defer_limit == 0 {
            return Err(crate::Error::Config("sync.defer_limit must be at least 1".into()));
        }

        if self.bulk_max_tries == 0 {
            return Err(crate::Error::Config("sync.bulk_max_tries must be at least 1".into()));
        }

        if self.buckets > 4096 {
            return Err(crate::Error::Config("sync.buckets cannot exceed 4096".into()));
        }

        self.bind_address.parse::<SocketAddr>()?;
        if let Some(peer) = &self.peer {
            peer.parse::<SocketAddr>()?;
        }

        if !self.multicast_group.is_multicast() {
            return Err(crate::Error::Config(format!(
                "sync.multicast_group {} is not a multicast address",
                self.multicast_group
            )));
        }

        Ok(())
    }

    /// Get the bucket count, auto-detecting when configured as 0
    pub fn bucket_count(&self) -> usize {
        if self.buckets > 0 {
            self.buckets
        } else {
            crate::tuning::auto_tune().buckets
        }
    }

    /// Get the outbound channel capacity, auto-detecting when configured as 0
    pub fn queue_len(&self) -> usize {
        if self.send_queue_len > 0 {
            self.send_queue_len
        } else {
            crate::tuning::auto_tune().send_queue_len
        }
    }

    /// Fill the auto-detected settings from a tuning result
    pub fn apply_tuning(&mut self, tuned: &TunedConfig) {
        if self.buckets == 0 {
            self.buckets = tuned.buckets;
        }
        if self.send_queue_len == 0 {
            self.send_queue_len = tuned.send_queue_len;
        }
    }

    /// Get defer timeout as Duration
    pub fn defer_timeout(&self) -> Duration {
        Duration::from_millis(self.defer_timeout_ms)
    }

    /// Get flush interval as Duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Get bulk retry interval as Duration
    pub fn bulk_retry(&self) -> Duration {
        Duration::from_millis(self.bulk_retry_ms)
    }

    /// Get bulk start grace as Duration
    pub fn bulk_start_grace(&self) -> Duration {
        Duration::from_millis(self.bulk_start_grace_ms)
    }
}

impl WolfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfSyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.host_id == Some(0) {
            return Err(crate::Error::Config("node.host_id cannot be 0".into()));
        }

        if self.node.ruleset.is_empty() {
            return Err(crate::Error::Config("node.ruleset cannot be empty".into()));
        }

        self.sync.validate()?;

        if self.api.enabled {
            self.api.bind_address.parse::<SocketAddr>()?;
        }

        Ok(())
    }

    /// Get the configured host id or pick a random non-zero one
    pub fn host_id(&self) -> u32 {
        match self.node.host_id {
            Some(id) => id,
            None => loop {
                let id: u32 = rand::random();
                if id != 0 {
                    break id;
                }
            },
        }
    }

    /// Digest of the ruleset identity carried in every datagram header
    pub fn digest(&self) -> [u8; DIGEST_LEN] {
        let hash = Sha256::digest(self.node.ruleset.as_bytes());
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&hash[..DIGEST_LEN]);
        digest
    }

    /// Get the sync socket bind address
    pub fn bind_address(&self) -> crate::Result<SocketAddr> {
        Ok(self.sync.bind_address.parse()?)
    }

    /// Get the destination for outbound datagrams
    pub fn destination(&self) -> crate::Result<SocketAddr> {
        match &self.sync.peer {
            Some(peer) => Ok(peer.parse()?),
            None => {
                let port = self.bind_address()?.port();
                Ok(SocketAddr::new(self.sync.multicast_group.into(), port))
            }
        }
    }
}
