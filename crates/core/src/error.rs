//! Error types for stowage-core
//!
//! Provides a unified error type shared by the transfer engine, the request
//! layer and the storage backends. Backends classify their failures onto
//! these variants so the engine can tell transient from permanent errors.

use thiserror::Error;

/// Result type alias for stowage-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for stowage-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid object path or local path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Profile not found
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Profile already exists
    #[error("Profile already exists: {0}")]
    ProfileExists(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Authorization rejected or missing for the requested space
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage quota exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Network error (retryable)
    #[error("Network error: {0}")]
    Network(String),

    /// Conflict error
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not valid in the current transfer state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transfer result requested before completion
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Transfer was cancelled
    #[error("Transfer cancelled")]
    Cancelled,

    /// Transient failures persisted past the retry budget
    #[error("Giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// General error
    #[error("{0}")]
    General(String),
}

impl Error {
    /// Whether the operation that produced this error may succeed if retried
    pub const fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// The innermost cause, looking through retry exhaustion
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
