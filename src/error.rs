//! WolfSync Error Types

use thiserror::Error;

use crate::wire::WireError;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    // Wire errors
    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    // State table errors
    #[error("State {id:016x}/{creator_id:08x} already exists")]
    StateExists { id: u64, creator_id: u32 },

    #[error("State table full ({0} states)")]
    TableFull(usize),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport closed")]
    TransportClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("No async runtime available: {0}")]
    Runtime(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }

    /// Check if the error means the transport is gone for good
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TransportClosed)
    }
}
