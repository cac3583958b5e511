//! WolfSync - Firewall Connection-State Replication
//!
//! Keeps the connection-state tables of cooperating firewalls in step so
//! that a standby can take over without dropping established flows.
//!
//! # Architecture
//!
//! Every firewall announces inserts, updates and deletes of its states to
//! its peers over a datagram protocol. Announcements are batched per bucket
//! and flushed when an MTU fills, when a timer fires, or at once when the
//! change is urgent. A node joining the cluster asks for a bulk transfer of
//! the whole table and stays demoted for failover until it completes.
//!
//! # Features
//!
//! - Compact wire format with two state record layouts
//! - Sequence-aware merging that never moves a connection backwards
//! - Optional deferral of packets until the peer acknowledges the state
//! - Bulk transfer with retry and failover demotion
//! - HTTP API for status, counters and operator actions

pub mod api;
pub mod config;
pub mod error;
pub mod failover;
pub mod network;
pub mod state;
pub mod sync;
pub mod tuning;
pub mod wire;

pub use config::WolfSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::failover::{DemotionCounter, FailoverHook};
    pub use crate::network::{ChannelTransport, Transport, UdpTransport};
    pub use crate::state::{MemoryStateTable, ReplicatedState, StateTable, SyncState};
    pub use crate::sync::{Outbound, SyncEngine};
    pub use crate::wire::{Message, StateRecord, StateRef};
}
