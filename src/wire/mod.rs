//! Wire Protocol
//!
//! Binary format exchanged between replicating firewalls. A datagram is a
//! [`Header`] followed by any number of action groups, each a [`SubHeader`]
//! and `count` fixed-size records, terminated by an `Eof` group.
//!
//! ```text
//! +---------+-----+--------+------------------+
//! | version | pad | length | identity digest  |   header, 20 bytes
//! +---------+-----+--------+------------------+
//! | action  | pad | count  |                      sub-header, 4 bytes
//! +---------+-----+--------+
//! | record 0 | record 1 | ... | record count-1 |
//! +--------------------------------------------+
//! | EOF     | pad |   0    |
//! +---------+-----+--------+
//! ```
//!
//! All multi-byte integers are big-endian. Insert and Update records exist
//! in two schema versions with distinct action codes; both decode into the
//! same [`StateRecord`].

pub mod codec;
pub mod record;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use codec::{decode, encode, Header, PacketBuilder, Reader, SubHeader};
pub use record::{
    Addr, BusStatusRecord, ClearRecord, CompressedUpdate, PeerState, SaRefreshRecord,
    ScrubState, StateExtensions, StateKey, StateRecord, StateRef,
};

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 6;

/// Length of the identity digest in the header
pub const DIGEST_LEN: usize = 16;

/// Header size in bytes
pub const HEADER_LEN: usize = 4 + DIGEST_LEN;

/// Sub-header size in bytes
pub const SUBHEADER_LEN: usize = 4;

/// Smallest datagram: header plus the terminating EOF sub-header
pub const MIN_PACKET: usize = HEADER_LEN + SUBHEADER_LEN;

/// Bulk status values
pub mod bus {
    pub const START: u8 = 1;
    pub const END: u8 = 2;
}

/// Negotiated Insert/Update record layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// First layout, with 8-bit state flags
    V1,
    /// Layout extended with routing, queueing, rate-limit and clamp fields
    #[default]
    V2,
}

impl SchemaVersion {
    /// Size of a full state record in this layout
    pub fn state_len(self) -> usize {
        match self {
            SchemaVersion::V1 => record::STATE_V1_LEN,
            SchemaVersion::V2 => record::STATE_V2_LEN,
        }
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaVersion::V1 => write!(f, "v1"),
            SchemaVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Action codes carried in sub-headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Clear,
    InsertV1,
    InsertAck,
    UpdateV1,
    UpdateCompressed,
    UpdateRequest,
    /// Deprecated full delete
    Delete,
    DeleteCompressed,
    /// Deprecated fragment insert
    InsertFragment,
    /// Deprecated fragment delete
    DeleteFragment,
    BusStatus,
    SaRefresh,
    Eof,
    InsertV2,
    UpdateV2,
}

impl Action {
    /// Decode an action code
    pub fn from_code(code: u8) -> Option<Self> {
        let action = match code {
            0 => Action::Clear,
            1 => Action::InsertV1,
            2 => Action::InsertAck,
            3 => Action::UpdateV1,
            4 => Action::UpdateCompressed,
            5 => Action::UpdateRequest,
            6 => Action::Delete,
            7 => Action::DeleteCompressed,
            8 => Action::InsertFragment,
            9 => Action::DeleteFragment,
            10 => Action::BusStatus,
            11 => Action::SaRefresh,
            12 => Action::Eof,
            13 => Action::InsertV2,
            14 => Action::UpdateV2,
            _ => return None,
        };
        Some(action)
    }

    /// Wire code of this action
    pub fn code(self) -> u8 {
        match self {
            Action::Clear => 0,
            Action::InsertV1 => 1,
            Action::InsertAck => 2,
            Action::UpdateV1 => 3,
            Action::UpdateCompressed => 4,
            Action::UpdateRequest => 5,
            Action::Delete => 6,
            Action::DeleteCompressed => 7,
            Action::InsertFragment => 8,
            Action::DeleteFragment => 9,
            Action::BusStatus => 10,
            Action::SaRefresh => 11,
            Action::Eof => 12,
            Action::InsertV2 => 13,
            Action::UpdateV2 => 14,
        }
    }

    /// Fixed record size, or `None` for actions that are no longer accepted
    pub fn record_len(self) -> Option<usize> {
        match self {
            Action::Clear => Some(record::CLEAR_LEN),
            Action::InsertV1 | Action::UpdateV1 => Some(record::STATE_V1_LEN),
            Action::InsertV2 | Action::UpdateV2 => Some(record::STATE_V2_LEN),
            Action::InsertAck | Action::UpdateRequest | Action::DeleteCompressed => {
                Some(record::STATE_REF_LEN)
            }
            Action::UpdateCompressed => Some(record::UPDATE_COMPRESSED_LEN),
            Action::BusStatus => Some(record::BUS_STATUS_LEN),
            Action::SaRefresh => Some(record::SA_REFRESH_LEN),
            Action::Eof => Some(0),
            Action::Delete | Action::InsertFragment | Action::DeleteFragment => None,
        }
    }

    fn insert(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::V1 => Action::InsertV1,
            SchemaVersion::V2 => Action::InsertV2,
        }
    }

    fn update(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::V1 => Action::UpdateV1,
            SchemaVersion::V2 => Action::UpdateV2,
        }
    }
}

/// One decoded action group
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Clear(Vec<ClearRecord>),
    Insert(Vec<StateRecord>),
    InsertAck(Vec<StateRef>),
    Update(Vec<StateRecord>),
    UpdateCompressed(Vec<CompressedUpdate>),
    UpdateRequest(Vec<StateRef>),
    DeleteCompressed(Vec<StateRef>),
    BusStatus(Vec<BusStatusRecord>),
    SaRefresh(Vec<SaRefreshRecord>),
    Eof,
    /// A deprecated action code; the rest of the datagram is unusable
    Error { action: u8 },
}

impl Message {
    /// Action code used when sending this message with the given layout
    pub fn action(&self, version: SchemaVersion) -> Action {
        match self {
            Message::Clear(_) => Action::Clear,
            Message::Insert(_) => Action::insert(version),
            Message::InsertAck(_) => Action::InsertAck,
            Message::Update(_) => Action::update(version),
            Message::UpdateCompressed(_) => Action::UpdateCompressed,
            Message::UpdateRequest(_) => Action::UpdateRequest,
            Message::DeleteCompressed(_) => Action::DeleteCompressed,
            Message::BusStatus(_) => Action::BusStatus,
            Message::SaRefresh(_) => Action::SaRefresh,
            Message::Eof => Action::Eof,
            Message::Error { action } => Action::from_code(*action).unwrap_or(Action::Delete),
        }
    }

    /// Number of records in the group
    pub fn count(&self) -> usize {
        match self {
            Message::Clear(r) => r.len(),
            Message::Insert(r) | Message::Update(r) => r.len(),
            Message::InsertAck(r) | Message::UpdateRequest(r) | Message::DeleteCompressed(r) => {
                r.len()
            }
            Message::UpdateCompressed(r) => r.len(),
            Message::BusStatus(r) => r.len(),
            Message::SaRefresh(r) => r.len(),
            Message::Eof | Message::Error { .. } => 0,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Clear(_) => "Clear",
            Message::Insert(_) => "Insert",
            Message::InsertAck(_) => "InsertAck",
            Message::Update(_) => "Update",
            Message::UpdateCompressed(_) => "UpdateCompressed",
            Message::UpdateRequest(_) => "UpdateRequest",
            Message::DeleteCompressed(_) => "DeleteCompressed",
            Message::BusStatus(_) => "BusStatus",
            Message::SaRefresh(_) => "SaRefresh",
            Message::Eof => "Eof",
            Message::Error { .. } => "Error",
        }
    }
}

/// Errors raised while decoding a datagram
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("declared length {declared} exceeds datagram length {actual}")]
    BadLength { declared: usize, actual: usize },

    #[error("unknown action code {0}")]
    BadAction(u8),

    #[error("{0} bytes after end-of-datagram marker")]
    TrailingData(usize),

    #[error("field {0} out of range")]
    BadValue(&'static str),
}
