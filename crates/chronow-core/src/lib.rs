//! Chronow core primitives.
//!
//! This crate holds the pieces shared by the store backends and the broker
//! client:
//!
//! - **Configuration** (`ChronowConfig`): backend selection, limits, and
//!   defaults, loadable from the process environment.
//! - **Key naming** (`KeySpace`, `Scope`): deterministic, collision-free
//!   composition of every hot-tier key.
//! - **Codec** (`codec`): JSON encoding with a payload size guard and
//!   content hashing for log entries.
//! - **Types** (`types`): subscription configuration, topic stats, and the
//!   other small value types that cross crate boundaries.
//!
//! Nothing in here talks to a store; that lives in `chronow-store`, and the
//! broker protocol on top of it lives in `chronow-client`.

pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod types;

pub use config::{ChronowConfig, HotBackend};
pub use error::{CoreError, Result};
pub use keys::{KeySpace, Scope, DEFAULT_NAMESPACE, DEFAULT_TENANT};
pub use types::{SubscriptionConfig, SubscriptionState, TopicStats};
