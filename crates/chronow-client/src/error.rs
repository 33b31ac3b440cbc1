//! Client-facing error type.
//!
//! Propagation policy: `publish`, `ack`, `nack`, and `dead_letter` failures
//! reach the caller; consumer-loop internal failures (retry drain, reclaim,
//! entry parsing) are logged and swallowed so the loop keeps running.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChronowError>;

#[derive(Debug, Error)]
pub enum ChronowError {
    /// Configuration or payload-size failure from the core layer.
    #[error(transparent)]
    Core(#[from] chronow_core::CoreError),

    /// A store could not be reached within the connect deadline. Fatal at
    /// initialisation, retryable at runtime.
    #[error("failed to connect to the {tier} store: {reason}")]
    ConnectFailed { tier: &'static str, reason: String },

    /// A consumer was attached to a subscription that was never ensured (or
    /// has been deleted). Fatal for that consumer.
    #[error("subscription '{subscription}' does not exist on topic '{topic}'")]
    SubscriptionNotFound { topic: String, subscription: String },

    /// Persisted state could not be decoded.
    #[error("could not decode {what}: {reason}")]
    Parse { what: String, reason: String },

    /// Any other store failure; transient at runtime.
    #[error(transparent)]
    Store(#[from] chronow_store::StoreError),
}
