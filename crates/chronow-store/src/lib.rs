//! Store abstractions backing the chronow broker.
//!
//! The broker depends on exactly two capability sets:
//!
//! - [`HotStore`] - the low-latency tier: append-only logs with consumer
//!   groups, keyed byte values with TTL, hashes, and sorted sets. Two
//!   interchangeable implementations ship here:
//!   [`MemoryHotStore`](memory::MemoryHotStore), an in-process streaming-log
//!   engine with native blocking reads and idle-based reclaim, and
//!   [`SqliteHotStore`](sqlite::SqliteHotStore), a document-database
//!   emulation that reproduces the same primitives through collections and
//!   polling.
//! - [`WarmStore`](warm::WarmStore) - the durable tier: four logical
//!   collections (`shared_memory`, `topics`, `messages`, `dead_letters`)
//!   with upsert/insert/find/delete operations.
//!
//! Code above this crate never branches on backend; both hot backends are
//! exercised by one shared contract-test suite (`tests/hot_contract.rs`).
//!
//! ## Semantics required of every `HotStore`
//!
//! - Log entry ids are `"<ms-timestamp>-<seq>"` and strictly increase within
//!   one log.
//! - `group_read` delivers each entry to at most one consumer of a group at
//!   a time and records it as in-flight; `group_ack` is terminal;
//!   `group_reclaim` transfers entries whose idle time exceeded the given
//!   threshold and resets their idle clock.
//! - Appends soft-trim the log toward `max_len`; trimming may drop entries
//!   that were never consumed.
//! - All operations are safe under concurrent callers.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod warm;
pub mod warm_sqlite;

pub use error::{Result, StoreError};
pub use memory::MemoryHotStore;
pub use sqlite::SqliteHotStore;
pub use warm::{
    DeadLetterDoc, MessageDoc, NullWarmStore, SharedMemoryDoc, SystemMeta, TopicDoc, WarmStore,
};
pub use warm_sqlite::SqliteWarmStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// One log entry as returned by reads, reclaims, and range scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// `"<ms>-<seq>"` id assigned at append.
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// One in-flight entry as returned by [`HotStore::group_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer currently holding the entry.
    pub consumer: String,
    /// Milliseconds since the entry was last delivered.
    pub idle_ms: u64,
    /// Times the entry has been handed out (initial read plus reclaims).
    pub deliveries: u64,
}

/// Log summary used by topic stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInfo {
    pub length: u64,
    pub groups: u64,
}

/// Start-of-log sentinel accepted by [`HotStore::log_range`].
pub const RANGE_MIN: &str = "-";
/// End-of-log sentinel accepted by [`HotStore::log_range`].
pub const RANGE_MAX: &str = "+";

/// The hot-tier command surface.
///
/// Scores are epoch milliseconds. TTLs apply to string and hash keys;
/// `kv_del` removes a key of any kind, including whole logs (topic purge
/// relies on this).
#[async_trait]
pub trait HotStore: Send + Sync {
    /// Connection probe used during initialisation.
    async fn ping(&self) -> Result<()>;

    /// Release backend resources. In-flight log entries stay reclaimable by
    /// future connections (where the backend is durable).
    async fn close(&self) -> Result<()>;

    // Keyed byte values -----------------------------------------------------

    /// Overwrite `key`, expiring after `ttl_sec` if given.
    async fn kv_set(&self, key: &str, value: Bytes, ttl_sec: Option<u64>) -> Result<()>;

    /// Current value, or `None` if absent or expired.
    async fn kv_get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove keys of any kind; returns how many existed.
    async fn kv_del(&self, keys: &[&str]) -> Result<u64>;

    /// Count how many of `keys` currently exist.
    async fn kv_exists(&self, keys: &[&str]) -> Result<u64>;

    /// Set a TTL on an existing key; `false` if the key is absent.
    async fn kv_expire(&self, key: &str, ttl_sec: u64) -> Result<bool>;

    // Hashes ----------------------------------------------------------------

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    // Logs and consumer groups ---------------------------------------------

    /// Append an entry, soft-trimming the log toward `max_len`; returns the
    /// assigned id. Creates the log when absent.
    async fn log_append(
        &self,
        log: &str,
        fields: &HashMap<String, String>,
        max_len: u64,
    ) -> Result<String>;

    async fn log_len(&self, log: &str) -> Result<u64>;

    /// Entries with `start <= id <= end`, oldest first, up to `count`.
    /// Accepts the [`RANGE_MIN`]/[`RANGE_MAX`] sentinels.
    async fn log_range(&self, log: &str, start: &str, end: &str, count: usize)
        -> Result<Vec<LogEntry>>;

    async fn log_info(&self, log: &str) -> Result<LogInfo>;

    /// Create a consumer group reading from `start_id` (`"0"` for the whole
    /// log, `"$"` for new entries only). Creates the log when absent.
    ///
    /// # Errors
    ///
    /// `GroupAlreadyExists` when the group is present - callers that treat
    /// creation as idempotent swallow that variant specifically.
    async fn group_create(&self, log: &str, group: &str, start_id: &str) -> Result<()>;

    /// Remove a consumer group and its in-flight state. Idempotent.
    async fn group_destroy(&self, log: &str, group: &str) -> Result<()>;

    /// Deliver up to `count` never-before-delivered entries to `consumer`,
    /// blocking up to `block_ms` when none are available, and record each
    /// returned entry as in-flight for `(group, consumer)`.
    async fn group_read(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Remove entries from the group's in-flight set; returns how many were
    /// actually in flight.
    async fn group_ack(&self, log: &str, group: &str, ids: &[&str]) -> Result<u64>;

    /// Transfer in-flight entries idle for at least `min_idle_ms` to
    /// `consumer`, resetting their idle clock and bumping their delivery
    /// count.
    async fn group_reclaim(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>>;

    /// Inspect up to `count` in-flight entries of a group.
    async fn group_pending(&self, log: &str, group: &str, count: usize)
        -> Result<Vec<PendingEntry>>;

    // Sorted sets -----------------------------------------------------------

    /// Insert or update a scored member.
    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<()>;

    /// Members with `min <= score <= max`, ascending by score, up to
    /// `limit`.
    async fn zset_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Remove members; returns how many were present.
    async fn zset_remove(&self, key: &str, members: &[&str]) -> Result<u64>;

    async fn zset_card(&self, key: &str) -> Result<u64>;
}

/// Current wall clock in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse an `"<ms>-<seq>"` entry id.
pub(crate) fn parse_entry_id(id: &str) -> Option<(i64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

/// Format an `"<ms>-<seq>"` entry id.
pub(crate) fn format_entry_id(ms: i64, seq: u64) -> String {
    format!("{}-{}", ms, seq)
}
