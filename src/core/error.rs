//! Error types for the sqlex access layer.
//!
//! One enum covers the whole crate so callers get a single wrapped error
//! type from `execute` and friends, with the underlying driver cause
//! preserved for diagnostics.

use thiserror::Error;

/// Crate-wide error type.
///
/// Configuration and missing-input errors are fatal for the call that
/// raised them; retrying with the same inputs would fail identically.
/// Execution errors wrap whatever the driver reported during
/// prepare/bind/execute. Resource-release errors leave the remaining
/// connections registered so release can be retried.
#[derive(Error, Debug)]
pub enum SqlexError {
    /// Invalid or missing connection configuration, surfaced at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The input map lacks a value for a declared statement parameter.
    #[error("missing input for parameter '{key}'; supplied keys: {supplied:?}")]
    MissingParameter { key: String, supplied: Vec<String> },

    /// A replacement marker in the statement text has no matching input.
    #[error("no input data to replace marker '{0}'")]
    MissingReplacement(String),

    /// Statement lookup failed or a statement definition is unusable.
    #[error("Statement error: {0}")]
    Statement(String),

    /// Database failure during prepare, bind or execute.
    #[error("Execution error: {0}")]
    Execution(#[from] rusqlite::Error),

    /// A connection failed to close during transaction resource release.
    #[error("failed to release connection '{connection}': {source}")]
    ResourceRelease {
        connection: String,
        source: rusqlite::Error,
    },

    /// File system and I/O errors (configuration loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors (result envelope export).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Result to use SqlexError as the error type.
pub type Result<T> = std::result::Result<T, SqlexError>;
