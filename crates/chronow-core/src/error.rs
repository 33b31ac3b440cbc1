//! Error types shared across the chronow crates.

use thiserror::Error;

/// Convenience alias used throughout `chronow-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by configuration loading and payload encoding.
///
/// Store-level failures have their own type in `chronow-store`; the client
/// crate wraps both.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Required configuration is missing or a variable failed to parse.
    /// Fatal at initialisation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// An encoded payload exceeds the configured limit. The message is not
    /// appended; callers see the actual and allowed sizes.
    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A value could not be encoded or decoded as JSON.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
