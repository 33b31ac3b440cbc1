//! Chronow: topics and subscriptions with at-least-once delivery over a
//! dual-tier store.
//!
//! The broker offers Service Bus-style messaging - durable topics, named
//! subscriptions, visibility-timeout redelivery, bounded retries with
//! exponential backoff, and a dead-letter queue - on top of two pluggable
//! tiers:
//!
//! - a **hot tier** ([`chronow_store::HotStore`]) holding the topic logs,
//!   in-flight state, retry sets, and cached values;
//! - a **warm tier** ([`chronow_store::WarmStore`]) durably mirroring
//!   messages, shared-memory values, topic metadata, and dead letters.
//!
//! Delivery is at-least-once: consumers must be idempotent. Ordering is
//! first-in-first-out within a single topic log; retries re-enter the log as
//! new entries and therefore break per-message order.
//!
//! ## Example
//!
//! ```ignore
//! use chronow_client::{Chronow, PublishOptions, SubscribeOptions};
//! use chronow_core::{ChronowConfig, SubscriptionConfig};
//! use serde_json::json;
//!
//! let broker = Chronow::connect(ChronowConfig::default()).await?;
//!
//! broker.topics()
//!     .ensure_subscription("orders", "fraud", SubscriptionConfig::default(), &Default::default())
//!     .await?;
//!
//! broker.producer()
//!     .publish("orders", &json!({"id": "A"}), PublishOptions::default())
//!     .await?;
//!
//! let subscriber = broker
//!     .subscribe("orders", "fraud", SubscribeOptions::default())
//!     .await?;
//! loop {
//!     for message in subscriber.poll().await? {
//!         println!("got {:?}", message.payload);
//!         message.ack().await?;
//!     }
//! }
//! ```

pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod producer;
pub mod retry;
pub mod shared_memory;
pub mod topics;

pub use consumer::{Message, NackOptions, SubscribeOptions, Subscriber};
pub use dead_letter::{DeadLetterRecord, DeadLetterSink};
pub use error::{ChronowError, Result};
pub use producer::{Producer, PublishOptions};
pub use retry::RetryScheduler;
pub use shared_memory::{SetOptions, SharedMemory, UpsertStrategy, WarmWrite};
pub use topics::TopicManager;

// Re-exported so most callers only import this crate.
pub use chronow_core::{ChronowConfig, HotBackend, Scope, SubscriptionConfig, TopicStats};

use chronow_core::KeySpace;
use chronow_store::{
    HotStore, MemoryHotStore, NullWarmStore, SqliteHotStore, SqliteWarmStore, WarmStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// Everything the broker components share.
pub(crate) struct Shared {
    pub(crate) hot: Arc<dyn HotStore>,
    pub(crate) warm: Arc<dyn WarmStore>,
    pub(crate) keys: KeySpace,
    pub(crate) config: ChronowConfig,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// The broker facade: owns both stores and hands out component handles.
pub struct Chronow {
    shared: Arc<Shared>,
    shared_memory: SharedMemory,
    topics: TopicManager,
    producer: Producer,
    retry: RetryScheduler,
    dead_letters: DeadLetterSink,
}

impl Chronow {
    /// Build the stores and components for `config`.
    ///
    /// Each store must come up within `config.connect_timeout_ms`;
    /// exceeding the deadline (or failing outright) is `ConnectFailed`.
    pub async fn connect(config: ChronowConfig) -> Result<Self> {
        config.validate()?;
        let deadline = Duration::from_millis(config.connect_timeout_ms);

        let hot: Arc<dyn HotStore> = match config.hot_backend {
            HotBackend::Native => Arc::new(MemoryHotStore::new()),
            HotBackend::Portable => {
                let url = config.hot_db_url.as_deref().unwrap_or_default().to_string();
                Arc::new(connect_within(deadline, "hot", SqliteHotStore::connect(&url)).await?)
            }
        };
        connect_within(deadline, "hot", hot.ping()).await?;

        let warm_url = config.warm_db_url.as_deref().unwrap_or("none").to_string();
        let warm: Arc<dyn WarmStore> = if warm_url == "none" {
            Arc::new(NullWarmStore)
        } else {
            Arc::new(connect_within(deadline, "warm", SqliteWarmStore::connect(&warm_url)).await?)
        };

        info!(
            backend = ?config.hot_backend,
            warm = %warm_url,
            "chronow connected"
        );

        let shared = Arc::new(Shared {
            hot,
            warm,
            keys: KeySpace::new(config.key_prefix.clone()),
            config,
        });
        Ok(Self {
            shared_memory: SharedMemory::new(Arc::clone(&shared)),
            topics: TopicManager::new(Arc::clone(&shared)),
            producer: Producer::new(Arc::clone(&shared)),
            retry: RetryScheduler::new(Arc::clone(&shared)),
            dead_letters: DeadLetterSink::new(Arc::clone(&shared)),
            shared,
        })
    }

    /// `connect` with configuration taken from the process environment.
    pub async fn from_env() -> Result<Self> {
        Self::connect(ChronowConfig::from_env()?).await
    }

    pub fn shared_memory(&self) -> &SharedMemory {
        &self.shared_memory
    }

    pub fn topics(&self) -> &TopicManager {
        &self.topics
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn retries(&self) -> &RetryScheduler {
        &self.retry
    }

    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.dead_letters
    }

    /// Escape hatch: the underlying hot store. The broker owns every key
    /// under its prefix; external code must not mutate them.
    pub fn hot_store(&self) -> Arc<dyn HotStore> {
        Arc::clone(&self.shared.hot)
    }

    /// Escape hatch: the underlying warm store (read-side inspection).
    pub fn warm_store(&self) -> Arc<dyn WarmStore> {
        Arc::clone(&self.shared.warm)
    }

    /// Attach a consumer to `(topic, subscription)`.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound` when the subscription was never ensured in the
    /// given scope (or has been deleted).
    pub async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: SubscribeOptions,
    ) -> Result<Subscriber> {
        Subscriber::attach(Arc::clone(&self.shared), topic, subscription, options).await
    }

    /// Close the warm store, then the hot store. In-flight messages remain
    /// in flight and will be reclaimed by any future consumer after their
    /// visibility timeout.
    pub async fn close(&self) -> Result<()> {
        self.shared.warm.close().await?;
        self.shared.hot.close().await?;
        Ok(())
    }
}

async fn connect_within<T>(
    deadline: Duration,
    tier: &'static str,
    fut: impl std::future::Future<Output = chronow_store::Result<T>>,
) -> Result<T> {
    match timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ChronowError::ConnectFailed {
            tier,
            reason: error.to_string(),
        }),
        Err(_) => Err(ChronowError::ConnectFailed {
            tier,
            reason: format!("timed out after {:?}", deadline),
        }),
    }
}

/// Entry field names shared by producer, retry drain, and consumer.
pub(crate) mod entry_fields {
    pub const PAYLOAD: &str = "payload";
    pub const HEADERS: &str = "headers";
    pub const HASH: &str = "hash";
    pub const SIZE: &str = "size";
    pub const PUBLISHED_AT: &str = "published_at";
    pub const RETRY_OF: &str = "retry_of";
    pub const ATTEMPT: &str = "attempt";
    pub const ORIGINAL_MSG_ID: &str = "original_msg_id";
    pub const REASON: &str = "reason";
    pub const DELIVERIES: &str = "deliveries";
    pub const FAILED_AT: &str = "failed_at";
}

/// Name of the throwaway group used to materialise empty logs.
pub(crate) const INIT_GROUP: &str = "init";
