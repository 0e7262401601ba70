//! Error types for fieldbook-core

use thiserror::Error;

/// Result type alias using fieldbook-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldbook-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Device is offline; work is deferred, not failed
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// Transient remote failure (feeds the backoff path)
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Backoff gave up; manual retry required
    #[error("Sync retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// Registration ID could not be allocated without a collision
    #[error("Registration ID collision: {0}")]
    AllocationCollision(String),

    /// Merge resolution did not assign every diffed field
    #[error("Merge incomplete, no choice for: {}", missing.join(", "))]
    MergeIncomplete { missing: Vec<String> },

    /// Conflict not found
    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    /// Conflict was already resolved
    #[error("Conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Local durable store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by the remote collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,
    #[error("remote unreachable: {0}")]
    Unavailable(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("registration ID already taken: {0}")]
    DuplicateId(String),
    #[error("invalid remote payload: {0}")]
    InvalidPayload(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() || error.is_request() {
            Self::Unavailable(error.to_string())
        } else if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else {
            Self::Http {
                status: error.status().map_or(0, |status| status.as_u16()),
                message: error.to_string(),
            }
        }
    }
}
