//! Warm-tier store: the durable document collections.
//!
//! The broker mirrors selected state into four logical collections, all
//! scoped by tenant:
//!
//! - `shared_memory` - versioned or upserted key/value documents with
//!   retention metadata and tombstones.
//! - `topics` - one row per `(topic, tenant)` with shard count.
//! - `messages` - optional durable copies of published messages.
//! - `dead_letters` - messages the broker gave up on.
//!
//! The warm tier is the source of truth for durability; the hot tier is a
//! bounded-lifetime cache in front of it. [`NullWarmStore`] is the stub
//! adapter for deployments that opt out: reads miss and writes are no-ops.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

/// Bookkeeping attached to every warm document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMeta {
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

/// Document in the `shared_memory` collection, identified by
/// `(key, namespace, tenant)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemoryDoc {
    pub key: String,
    pub namespace: String,
    pub tenant: String,
    /// `None` marks a tombstoned value.
    pub value: Option<serde_json::Value>,
    pub system: SystemMeta,
}

/// Document in the `topics` collection, identified by `(topic, tenant)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDoc {
    pub topic: String,
    pub tenant: String,
    pub shards: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Document in the `messages` collection, identified by
/// `(topic, msg_id, tenant)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDoc {
    pub topic: String,
    pub msg_id: String,
    pub tenant: String,
    pub headers: HashMap<String, String>,
    pub payload: serde_json::Value,
    /// ISO-8601 publish time.
    pub first_seen_at: String,
    pub size: u64,
    pub created_at: i64,
}

/// Document in the `dead_letters` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterDoc {
    pub topic: String,
    pub msg_id: String,
    pub tenant: String,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub payload: serde_json::Value,
    /// ISO-8601 failure time.
    pub failed_at: String,
    pub deliveries: u32,
    pub created_at: i64,
}

/// Durable document store consumed by the broker.
///
/// The broker owns these collections exclusively and assumes the identity
/// tuples above are unique (except `shared_memory`, where the `append`
/// strategy intentionally versions rows and reads return the newest).
#[async_trait]
pub trait WarmStore: Send + Sync {
    /// Upsert in place: the `latest` shared-memory strategy.
    async fn upsert_shared_memory(&self, doc: &SharedMemoryDoc) -> Result<()>;

    /// Insert a fresh versioned row: the `append` shared-memory strategy.
    async fn append_shared_memory(&self, doc: &SharedMemoryDoc) -> Result<()>;

    /// Most recently written document for the identity, tombstoned or not.
    async fn find_shared_memory(
        &self,
        tenant: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<SharedMemoryDoc>>;

    async fn upsert_topic(&self, doc: &TopicDoc) -> Result<()>;

    async fn insert_message(&self, doc: &MessageDoc) -> Result<()>;

    async fn find_message(
        &self,
        tenant: &str,
        topic: &str,
        msg_id: &str,
    ) -> Result<Option<MessageDoc>>;

    async fn insert_dead_letter(&self, doc: &DeadLetterDoc) -> Result<()>;

    /// Dead letters for a topic, newest last, up to `limit`.
    async fn find_dead_letters(
        &self,
        tenant: &str,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterDoc>>;

    /// Remove a topic's dead letters; returns how many were deleted.
    async fn delete_dead_letters(&self, tenant: &str, topic: &str) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

/// Stub warm store: every read misses, every write is a no-op.
///
/// Hot-tier semantics are unchanged; only durability and read-through are
/// lost, which is exactly the trade the stub deployment makes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullWarmStore;

#[async_trait]
impl WarmStore for NullWarmStore {
    async fn upsert_shared_memory(&self, _doc: &SharedMemoryDoc) -> Result<()> {
        Ok(())
    }

    async fn append_shared_memory(&self, _doc: &SharedMemoryDoc) -> Result<()> {
        Ok(())
    }

    async fn find_shared_memory(
        &self,
        _tenant: &str,
        _namespace: &str,
        _key: &str,
    ) -> Result<Option<SharedMemoryDoc>> {
        Ok(None)
    }

    async fn upsert_topic(&self, _doc: &TopicDoc) -> Result<()> {
        Ok(())
    }

    async fn insert_message(&self, _doc: &MessageDoc) -> Result<()> {
        Ok(())
    }

    async fn find_message(
        &self,
        _tenant: &str,
        _topic: &str,
        _msg_id: &str,
    ) -> Result<Option<MessageDoc>> {
        Ok(None)
    }

    async fn insert_dead_letter(&self, _doc: &DeadLetterDoc) -> Result<()> {
        Ok(())
    }

    async fn find_dead_letters(
        &self,
        _tenant: &str,
        _topic: &str,
        _limit: usize,
    ) -> Result<Vec<DeadLetterDoc>> {
        Ok(Vec::new())
    }

    async fn delete_dead_letters(&self, _tenant: &str, _topic: &str) -> Result<u64> {
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
