//! Error types for the abc_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for abc_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol table validation error
    #[error("Protocol validation error: {0}")]
    ProtocolValidation(String),

    /// Malformed date, code, weight, or case number supplied by a caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A case number was taken between allocation and insert.
    ///
    /// Recovery is to recompute and retry; see `allocator::allocate_with_retry`.
    #[error("Case number already taken: {0}")]
    AllocationRace(String),

    /// Record lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lifecycle step not allowed from the case's current status
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
