//! Store-level errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the hot and warm store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `group_create` found the group already present. Idempotent callers
    /// swallow exactly this variant.
    #[error("consumer group '{group}' already exists on log '{log}'")]
    GroupAlreadyExists { log: String, group: String },

    /// A group operation referenced a log or group that does not exist.
    #[error("consumer group '{group}' does not exist on log '{log}'")]
    GroupNotFound { log: String, group: String },

    /// A key holds a value of a different kind than the operation expects
    /// (e.g. hash command against a log key).
    #[error("key '{key}' holds a value of the wrong kind for this operation")]
    WrongKind { key: String },

    /// An optimistic update lost too many races in a row. Transient; callers
    /// retry on their next iteration.
    #[error("concurrent update conflict on key '{key}'")]
    Conflict { key: String },

    /// Underlying database failure. Transient at runtime; fatal during
    /// initialisation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored document could not be encoded or decoded.
    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}
