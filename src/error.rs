//! Error types for VaultDisk
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using VaultError
pub type Result<T> = std::result::Result<T, VaultError>;

/// Unified error type for VaultDisk operations
#[derive(Debug, Error)]
pub enum VaultError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device already in exclusive use")]
    Busy,

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    /// A legitimate miss: the entry does not exist. Converted to `None` on
    /// the engine read path, never surfaced as a failure there.
    #[error("not found")]
    NotFound,

    #[error("index out of range")]
    OutOfRange,

    // -------------------------------------------------------------------------
    // Space Errors
    // -------------------------------------------------------------------------
    /// Segment allocator exhausted, or a level exceeded its fixed maximum.
    #[error("out of space")]
    OutOfSpace,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    /// Authenticated decryption failed. Fatal to the triggering operation,
    /// never retried; the sole corruption/tamper detector.
    #[error("authentication failure")]
    AuthFailure,

    #[error("invalid state: {0}")]
    InvalidState(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for VaultError {
    fn from(e: bincode::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}
