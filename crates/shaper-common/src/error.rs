//! Error types for the shaper

use thiserror::Error;

/// Shaper error type
#[derive(Error, Debug)]
pub enum ShaperError {
    /// Rate is zero or rounds down to zero bytes per second
    #[error("invalid rate: {0} bit/s")]
    InvalidRate(u64),

    /// Address could not be parsed as IPv4
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    /// Bounded store has no room for a new key
    #[error("state store full ({capacity} entries)")]
    StoreFull {
        /// Configured maximum entry count
        capacity: usize,
    },

    /// Update-existing write found no entry
    #[error("key not found")]
    KeyNotFound,

    /// Insert-only write found an entry
    #[error("key already exists")]
    KeyExists,

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for the shaper
pub type ShaperResult<T> = Result<T, ShaperError>;
