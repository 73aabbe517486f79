//! Error types for the ledgerlink-store crate.
//!
//! Every store operation returns [`StoreResult`].

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// Resume, pause, progress or completion was requested for a checkpoint
    /// id that does not exist.
    #[error("sync checkpoint not found: {id}")]
    CheckpointNotFound { id: String },

    /// The checkpoint already reached a terminal status and can no longer
    /// be mutated.
    #[error("sync checkpoint {id} is already {status}")]
    CheckpointFinalized { id: String, status: String },

    /// The requested status change is not part of the checkpoint lifecycle.
    #[error("invalid checkpoint transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
