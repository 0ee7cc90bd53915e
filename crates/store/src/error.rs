//! Store error type.

use playmill_core::EngineError;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found.
    #[error("execution not found: {0}")]
    ExecutionNotFound(i64),

    /// Queue entry not found.
    #[error("queue entry not found: {0}")]
    EntryNotFound(i64),

    /// Catalog entry not found.
    #[error("playbook not found: {path} (version {version:?})")]
    PlaybookNotFound { path: String, version: Option<i32> },

    /// The caller no longer owns the lease it is reporting against.
    #[error("lease lost for queue entry {0}")]
    LeaseLost(i64),

    /// Concurrent writers raced on the same transition; re-fold and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database failure.
    #[error("database error: {0}")]
    Database(String),

    /// (De)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Credential payload could not be sealed or opened.
    #[error("encryption error: {0}")]
    Encryption(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        Self::Serialization(e.to_string())
    }
}
