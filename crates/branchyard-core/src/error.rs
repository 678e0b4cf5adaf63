//! Error types for `Branchyard` core library.

use thiserror::Error;

/// Result type alias using `Branchyard` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Branchyard` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// NDJSON parsing error
    #[error("Failed to parse NDJSON: {0}")]
    NdjsonParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A patch operation could not be applied to a conversation
    #[error("Invalid patch: {0}")]
    Patch(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
