//! Error types for drivesync-core

use thiserror::Error;

/// Main error type for the drivesync-core library
#[derive(Error, Debug)]
pub enum Error {
    /// A tracker setting or position sample failed validation.
    ///
    /// Rejected at the boundary; never persisted.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Local store could not durably commit or read
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error for captured sensor streams
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure or 5xx from the remote API
    #[error("network error: {0}")]
    Network(String),

    /// Remote API refused the batch
    #[error("remote rejected batch ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Remote API refused the batch because of its size
    #[error("batch of {size} records exceeds the remote limit")]
    BatchTooLarge { size: usize },
}

impl Error {
    /// Shorthand for building a [`Error::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True for failures where the same batch may succeed on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

/// Result type alias for drivesync-core
pub type Result<T> = std::result::Result<T, Error>;
