//! Portable hot store: document-database emulation over SQLite.
//!
//! This backend reproduces the streaming-log/KV/zset/hash primitives through
//! three collections in a single hot database:
//!
//! - `kv` - one document per key: byte values (`kind = 'string'`), hashes and
//!   sorted sets (`kind = 'hash' | 'zset'`, members inside the `doc` JSON
//!   column), with an optional `expires_at` for TTLs. Expired rows are
//!   removed by a background sweep, decoupled from reads (reads filter on
//!   `expires_at` themselves).
//! - `stream_entries` - one document per log entry: `(stream, id, ts, seq)`,
//!   the entry `fields` as JSON, and a `pending` JSON document mapping each
//!   consumer group to its in-flight ownership record
//!   `{consumer, delivered_at, deliveries}`.
//! - `stream_groups` - one row per consumer group with its read cursor;
//!   unique on `(stream, grp)`, so duplicate creation surfaces as
//!   `GroupAlreadyExists`.
//!
//! Entry ids follow the `"<nowMs>-<count-with-same-nowMs>"` rule. Blocking
//! reads are emulated: when nothing matches and `block_ms > 0`, the read
//! sleeps `min(block_ms, 1000)` ms and retries once - callers approximate
//! longer blocks by re-entering their loop. Ownership updates are optimistic
//! (compare-and-swap on the previous `pending` document), which keeps
//! `group_read`/`group_ack`/`group_reclaim` atomic with respect to each
//! other under concurrent consumers.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::{format_entry_id, now_ms, parse_entry_id, HotStore, LogEntry, LogInfo, PendingEntry};
use crate::{RANGE_MAX, RANGE_MIN};

/// Cap on a single emulated blocking-read sleep.
const BLOCK_CAP_MS: u64 = 1_000;

/// Interval between TTL sweeps.
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts for optimistic read-modify-write updates before giving up.
const RMW_ATTEMPTS: usize = 16;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS kv (
        key        TEXT PRIMARY KEY,
        kind       TEXT NOT NULL,
        value      BLOB,
        doc        TEXT,
        expires_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at) WHERE expires_at IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS stream_entries (
        stream  TEXT NOT NULL,
        id      TEXT NOT NULL,
        ts      INTEGER NOT NULL,
        seq     INTEGER NOT NULL,
        fields  TEXT NOT NULL,
        pending TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (stream, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_stream_order ON stream_entries(stream, ts, seq)",
    "CREATE TABLE IF NOT EXISTS stream_groups (
        stream     TEXT NOT NULL,
        grp        TEXT NOT NULL,
        last_ts    INTEGER NOT NULL DEFAULT 0,
        last_seq   INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (stream, grp)
    )",
];

/// SQLite-backed [`HotStore`] implementation (the portable backend).
pub struct SqliteHotStore {
    pool: SqlitePool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SqliteHotStore {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

impl SqliteHotStore {
    /// Connect to `url` (`sqlite://path`, a bare path, or `sqlite::memory:`)
    /// and initialise the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives and dies with its connection; the pool
        // must hold exactly one and never recycle it.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let sweeper = Self::spawn_ttl_sweeper(pool.clone());
        Ok(Self {
            pool,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Fresh private in-memory database; used by tests and throwaway
    /// deployments.
    pub async fn connect_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Asynchronous removal of expired kv rows, standing in for the
    /// document database's TTL index. Reads never depend on the sweep; they
    /// filter on `expires_at` directly.
    fn spawn_ttl_sweeper(pool: SqlitePool) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TTL_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result =
                    sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                        .bind(now_ms())
                        .execute(&pool)
                        .await;
                match result {
                    Ok(done) if done.rows_affected() > 0 => {
                        debug!(expired = done.rows_affected(), "swept expired kv rows");
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%error, "ttl sweep failed"),
                }
            }
        })
    }

    /// JSON path addressing one group inside a `pending` document.
    fn pending_path(group: &str) -> String {
        format!("$.\"{}\"", group)
    }

    /// Optimistic read-modify-write against a `doc`-kinded kv row.
    async fn doc_rmw<R: Send>(
        &self,
        key: &str,
        kind: &str,
        mut mutate: impl FnMut(&mut Map<String, Value>) -> R + Send,
    ) -> Result<R> {
        for _ in 0..RMW_ATTEMPTS {
            let row: Option<(String, Option<String>)> = sqlx::query_as(
                "SELECT kind, doc FROM kv
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            )
            .bind(key)
            .bind(now_ms())
            .fetch_optional(&self.pool)
            .await?;

            match row {
                None => {
                    let mut doc = Map::new();
                    let result = mutate(&mut doc);
                    let inserted = sqlx::query(
                        "INSERT INTO kv (key, kind, value, doc, expires_at)
                         VALUES (?1, ?2, NULL, ?3, NULL)
                         ON CONFLICT(key) DO NOTHING",
                    )
                    .bind(key)
                    .bind(kind)
                    .bind(serde_json::to_string(&doc)?)
                    .execute(&self.pool)
                    .await?;
                    if inserted.rows_affected() == 1 {
                        return Ok(result);
                    }
                }
                Some((found_kind, doc)) => {
                    if found_kind != kind {
                        return Err(StoreError::WrongKind {
                            key: key.to_string(),
                        });
                    }
                    let old = doc.unwrap_or_else(|| "{}".to_string());
                    let mut parsed: Map<String, Value> = serde_json::from_str(&old)?;
                    let result = mutate(&mut parsed);
                    let updated = sqlx::query("UPDATE kv SET doc = ?3 WHERE key = ?1 AND doc = ?2")
                        .bind(key)
                        .bind(&old)
                        .bind(serde_json::to_string(&parsed)?)
                        .execute(&self.pool)
                        .await?;
                    if updated.rows_affected() == 1 {
                        return Ok(result);
                    }
                }
            }
        }
        Err(StoreError::Conflict {
            key: key.to_string(),
        })
    }

    /// Read a `doc`-kinded kv row, enforcing its kind.
    async fn doc_read(&self, key: &str, kind: &str) -> Result<Option<Map<String, Value>>> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT kind, doc FROM kv
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some((found_kind, doc)) => {
                if found_kind != kind {
                    return Err(StoreError::WrongKind {
                        key: key.to_string(),
                    });
                }
                let doc = doc.unwrap_or_else(|| "{}".to_string());
                Ok(Some(serde_json::from_str(&doc)?))
            }
        }
    }

    fn decode_pending(raw: &str) -> Result<Map<String, Value>> {
        Ok(serde_json::from_str(raw)?)
    }

    fn ownership(consumer: &str, delivered_at: i64, deliveries: u64) -> Value {
        let mut record = Map::new();
        record.insert("consumer".to_string(), Value::from(consumer));
        record.insert("delivered_at".to_string(), Value::from(delivered_at));
        record.insert("deliveries".to_string(), Value::from(deliveries));
        Value::Object(record)
    }

    /// Rewrite one entry's `pending` document if it still matches `old`.
    async fn swap_pending(&self, stream: &str, id: &str, old: &str, new: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE stream_entries SET pending = ?4
             WHERE stream = ?1 AND id = ?2 AND pending = ?3",
        )
        .bind(stream)
        .bind(id)
        .bind(old)
        .bind(new)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn group_cursor(&self, log: &str, group: &str) -> Result<(i64, u64)> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT last_ts, last_seq FROM stream_groups WHERE stream = ?1 AND grp = ?2")
                .bind(log)
                .bind(group)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(ts, seq)| (ts, seq as u64))
            .ok_or_else(|| StoreError::GroupNotFound {
                log: log.to_string(),
                group: group.to_string(),
            })
    }

    /// One non-blocking read attempt: select candidates past the cursor and
    /// claim them via compare-and-swap.
    async fn read_attempt(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let (last_ts, last_seq) = self.group_cursor(log, group).await?;
        let rows: Vec<(String, i64, i64, String, String)> = sqlx::query_as(
            "SELECT id, ts, seq, fields, pending FROM stream_entries
             WHERE stream = ?1 AND (ts > ?2 OR (ts = ?2 AND seq > ?3))
             ORDER BY ts, seq LIMIT ?4",
        )
        .bind(log)
        .bind(last_ts)
        .bind(last_seq as i64)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let now = now_ms();
        let mut claimed = Vec::new();
        let mut cursor = (last_ts, last_seq as i64);
        for (id, ts, seq, fields, pending_raw) in rows {
            let mut pending = Self::decode_pending(&pending_raw)?;
            if pending.contains_key(group) {
                continue;
            }
            pending.insert(group.to_string(), Self::ownership(consumer, now, 1));
            let new_raw = serde_json::to_string(&pending)?;
            if !self.swap_pending(log, &id, &pending_raw, &new_raw).await? {
                // Another consumer claimed it first.
                continue;
            }
            cursor = cursor.max((ts, seq));
            claimed.push(LogEntry {
                id,
                fields: serde_json::from_str(&fields)?,
            });
        }

        if cursor > (last_ts, last_seq as i64) {
            sqlx::query(
                "UPDATE stream_groups SET last_ts = ?3, last_seq = ?4
                 WHERE stream = ?1 AND grp = ?2
                   AND (last_ts < ?3 OR (last_ts = ?3 AND last_seq < ?4))",
            )
            .bind(log)
            .bind(group)
            .bind(cursor.0)
            .bind(cursor.1)
            .execute(&self.pool)
            .await?;
        }
        Ok(claimed)
    }

    fn range_bounds(start: &str, end: &str) -> ((i64, i64), (i64, i64)) {
        let start_key = if start == RANGE_MIN {
            (i64::MIN, i64::MIN)
        } else {
            parse_entry_id(start)
                .map(|(ms, seq)| (ms, seq as i64))
                .unwrap_or((i64::MIN, i64::MIN))
        };
        let end_key = if end == RANGE_MAX {
            (i64::MAX, i64::MAX)
        } else {
            parse_entry_id(end)
                .map(|(ms, seq)| (ms, seq as i64))
                .unwrap_or((i64::MAX, i64::MAX))
        };
        (start_key, end_key)
    }
}

#[async_trait]
impl HotStore for SqliteHotStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(sweeper) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            sweeper.abort();
        }
        self.pool.close().await;
        Ok(())
    }

    async fn kv_set(&self, key: &str, value: Bytes, ttl_sec: Option<u64>) -> Result<()> {
        let expires_at = ttl_sec.map(|s| now_ms() + (s as i64) * 1_000);
        sqlx::query(
            "INSERT INTO kv (key, kind, value, doc, expires_at)
             VALUES (?1, 'string', ?2, NULL, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 kind = 'string',
                 value = excluded.value,
                 doc = NULL,
                 expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value.as_ref())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Bytes>> {
        let row: Option<(String, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT kind, value FROM kv
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some((kind, value)) => {
                if kind != "string" {
                    return Err(StoreError::WrongKind {
                        key: key.to_string(),
                    });
                }
                Ok(Some(Bytes::from(value.unwrap_or_default())))
            }
        }
    }

    async fn kv_del(&self, keys: &[&str]) -> Result<u64> {
        let now = now_ms();
        let mut removed = 0;
        for key in keys {
            let live = sqlx::query(
                "DELETE FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            )
            .bind(*key)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
            // Drop any expired leftover without counting it.
            sqlx::query("DELETE FROM kv WHERE key = ?1")
                .bind(*key)
                .execute(&self.pool)
                .await?;

            let entries = sqlx::query("DELETE FROM stream_entries WHERE stream = ?1")
                .bind(*key)
                .execute(&self.pool)
                .await?
                .rows_affected();
            let groups = sqlx::query("DELETE FROM stream_groups WHERE stream = ?1")
                .bind(*key)
                .execute(&self.pool)
                .await?
                .rows_affected();

            if live > 0 || entries > 0 || groups > 0 {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn kv_exists(&self, keys: &[&str]) -> Result<u64> {
        let now = now_ms();
        let mut present = 0;
        for key in keys {
            let found: (i64,) = sqlx::query_as(
                "SELECT EXISTS(
                     SELECT 1 FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ) OR EXISTS(SELECT 1 FROM stream_entries WHERE stream = ?1)
                   OR EXISTS(SELECT 1 FROM stream_groups WHERE stream = ?1)",
            )
            .bind(*key)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            if found.0 != 0 {
                present += 1;
            }
        }
        Ok(present)
    }

    async fn kv_expire(&self, key: &str, ttl_sec: u64) -> Result<bool> {
        let now = now_ms();
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT kind FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row.map(|(kind,)| kind) {
            None => Ok(false),
            Some(kind) if kind == "zset" => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
            Some(_) => {
                sqlx::query("UPDATE kv SET expires_at = ?2 WHERE key = ?1")
                    .bind(key)
                    .bind(now + (ttl_sec as i64) * 1_000)
                    .execute(&self.pool)
                    .await?;
                Ok(true)
            }
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let field = field.to_string();
        let value = value.to_string();
        self.doc_rmw(key, "hash", move |doc| {
            doc.insert(field.clone(), Value::from(value.clone()));
        })
        .await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let doc = self.doc_read(key, "hash").await?;
        Ok(doc
            .and_then(|d| d.get(field).cloned())
            .and_then(|v| v.as_str().map(|s| s.to_string())))
    }

    async fn log_append(
        &self,
        log: &str,
        fields: &HashMap<String, String>,
        max_len: u64,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await?;

        let last: Option<(i64, i64)> = sqlx::query_as(
            "SELECT ts, seq FROM stream_entries WHERE stream = ?1
             ORDER BY ts DESC, seq DESC LIMIT 1",
        )
        .bind(log)
        .fetch_optional(&mut *tx)
        .await?;

        let now = now_ms();
        let (ts, seq) = match last {
            Some((last_ts, last_seq)) if now <= last_ts => (last_ts, last_seq + 1),
            _ => (now, 0),
        };
        let id = format_entry_id(ts, seq as u64);

        sqlx::query(
            "INSERT INTO stream_entries (stream, id, ts, seq, fields, pending)
             VALUES (?1, ?2, ?3, ?4, ?5, '{}')",
        )
        .bind(log)
        .bind(&id)
        .bind(ts)
        .bind(seq)
        .bind(serde_json::to_string(fields)?)
        .execute(&mut *tx)
        .await?;

        let (length,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM stream_entries WHERE stream = ?1")
                .bind(log)
                .fetch_one(&mut *tx)
                .await?;
        let excess = length - max_len as i64;
        if excess > 0 {
            sqlx::query(
                "DELETE FROM stream_entries WHERE stream = ?1 AND rowid IN (
                     SELECT rowid FROM stream_entries WHERE stream = ?1
                     ORDER BY ts ASC, seq ASC LIMIT ?2
                 )",
            )
            .bind(log)
            .bind(excess)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn log_len(&self, log: &str) -> Result<u64> {
        let (length,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM stream_entries WHERE stream = ?1")
                .bind(log)
                .fetch_one(&self.pool)
                .await?;
        Ok(length as u64)
    }

    async fn log_range(
        &self,
        log: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let ((s_ts, s_seq), (e_ts, e_seq)) = Self::range_bounds(start, end);
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, fields FROM stream_entries
             WHERE stream = ?1
               AND (ts > ?2 OR (ts = ?2 AND seq >= ?3))
               AND (ts < ?4 OR (ts = ?4 AND seq <= ?5))
             ORDER BY ts, seq LIMIT ?6",
        )
        .bind(log)
        .bind(s_ts)
        .bind(s_seq)
        .bind(e_ts)
        .bind(e_seq)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, fields)| {
                Ok(LogEntry {
                    id,
                    fields: serde_json::from_str(&fields)?,
                })
            })
            .collect()
    }

    async fn log_info(&self, log: &str) -> Result<LogInfo> {
        let length = self.log_len(log).await?;
        let (groups,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM stream_groups WHERE stream = ?1")
                .bind(log)
                .fetch_one(&self.pool)
                .await?;
        Ok(LogInfo {
            length,
            groups: groups as u64,
        })
    }

    async fn group_create(&self, log: &str, group: &str, start_id: &str) -> Result<()> {
        let (last_ts, last_seq) = match start_id {
            "$" => {
                let last: Option<(i64, i64)> = sqlx::query_as(
                    "SELECT ts, seq FROM stream_entries WHERE stream = ?1
                     ORDER BY ts DESC, seq DESC LIMIT 1",
                )
                .bind(log)
                .fetch_optional(&self.pool)
                .await?;
                last.unwrap_or((0, 0))
            }
            "0" => (0, 0),
            other => parse_entry_id(other)
                .map(|(ms, seq)| (ms, seq as i64))
                .unwrap_or((0, 0)),
        };

        let inserted = sqlx::query(
            "INSERT INTO stream_groups (stream, grp, last_ts, last_seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(log)
        .bind(group)
        .bind(last_ts)
        .bind(last_seq)
        .bind(now_ms())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(error) if error.to_string().contains("UNIQUE constraint failed") => {
                Err(StoreError::GroupAlreadyExists {
                    log: log.to_string(),
                    group: group.to_string(),
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn group_destroy(&self, log: &str, group: &str) -> Result<()> {
        sqlx::query("DELETE FROM stream_groups WHERE stream = ?1 AND grp = ?2")
            .bind(log)
            .bind(group)
            .execute(&self.pool)
            .await?;

        // Clear the group's ownership records so a recreated group does not
        // inherit stale in-flight state.
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, pending FROM stream_entries
             WHERE stream = ?1 AND json_extract(pending, ?2) IS NOT NULL",
        )
        .bind(log)
        .bind(Self::pending_path(group))
        .fetch_all(&self.pool)
        .await?;
        for (id, pending_raw) in rows {
            let mut pending = Self::decode_pending(&pending_raw)?;
            pending.remove(group);
            let new_raw = serde_json::to_string(&pending)?;
            let _ = self.swap_pending(log, &id, &pending_raw, &new_raw).await?;
        }
        Ok(())
    }

    async fn group_read(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let claimed = self.read_attempt(log, group, consumer, count).await?;
        if !claimed.is_empty() || block_ms == 0 {
            return Ok(claimed);
        }
        // Emulated block: one sleep, one retry. Callers re-enter their loop
        // to approximate longer blocks.
        tokio::time::sleep(Duration::from_millis(block_ms.min(BLOCK_CAP_MS))).await;
        self.read_attempt(log, group, consumer, count).await
    }

    async fn group_ack(&self, log: &str, group: &str, ids: &[&str]) -> Result<u64> {
        let mut acked = 0;
        for id in ids {
            for _ in 0..RMW_ATTEMPTS {
                let row: Option<(String,)> = sqlx::query_as(
                    "SELECT pending FROM stream_entries WHERE stream = ?1 AND id = ?2",
                )
                .bind(log)
                .bind(*id)
                .fetch_optional(&self.pool)
                .await?;
                let Some((pending_raw,)) = row else { break };
                let mut pending = Self::decode_pending(&pending_raw)?;
                if pending.remove(group).is_none() {
                    break;
                }
                let new_raw = serde_json::to_string(&pending)?;
                if self.swap_pending(log, id, &pending_raw, &new_raw).await? {
                    acked += 1;
                    break;
                }
            }
        }
        Ok(acked)
    }

    async fn group_reclaim(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let now = now_ms();
        let cutoff = now - min_idle_ms as i64;
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT id, fields, pending FROM stream_entries
             WHERE stream = ?1
               AND json_extract(pending, ?2) IS NOT NULL
               AND json_extract(pending, ?3) <= ?4
             ORDER BY ts, seq LIMIT ?5",
        )
        .bind(log)
        .bind(Self::pending_path(group))
        .bind(format!("{}.delivered_at", Self::pending_path(group)))
        .bind(cutoff)
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::new();
        for (id, fields, pending_raw) in rows {
            let mut pending = Self::decode_pending(&pending_raw)?;
            let deliveries = pending
                .get(group)
                .and_then(|o| o.get("deliveries"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            pending.insert(
                group.to_string(),
                Self::ownership(consumer, now, deliveries + 1),
            );
            let new_raw = serde_json::to_string(&pending)?;
            if self.swap_pending(log, &id, &pending_raw, &new_raw).await? {
                reclaimed.push(LogEntry {
                    id,
                    fields: serde_json::from_str(&fields)?,
                });
            }
        }
        Ok(reclaimed)
    }

    async fn group_pending(
        &self,
        log: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let now = now_ms();
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, pending FROM stream_entries
             WHERE stream = ?1 AND json_extract(pending, ?2) IS NOT NULL
             ORDER BY ts, seq LIMIT ?3",
        )
        .bind(log)
        .bind(Self::pending_path(group))
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for (id, pending_raw) in rows {
            let pending = Self::decode_pending(&pending_raw)?;
            let Some(ownership) = pending.get(group) else {
                continue;
            };
            let consumer = ownership
                .get("consumer")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let delivered_at = ownership
                .get("delivered_at")
                .and_then(Value::as_i64)
                .unwrap_or(now);
            let deliveries = ownership
                .get("deliveries")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            out.push(PendingEntry {
                id,
                consumer,
                idle_ms: (now - delivered_at).max(0) as u64,
                deliveries,
            });
        }
        Ok(out)
    }

    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let member = member.to_string();
        self.doc_rmw(key, "zset", move |doc| {
            doc.insert(member.clone(), Value::from(score));
        })
        .await
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let Some(doc) = self.doc_read(key, "zset").await? else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(i64, String)> = doc
            .into_iter()
            .filter_map(|(member, score)| score.as_i64().map(|s| (s, member)))
            .filter(|(score, _)| *score >= min && *score <= max)
            .collect();
        scored.sort();
        Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
    }

    async fn zset_remove(&self, key: &str, members: &[&str]) -> Result<u64> {
        let members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        let exists: Option<Map<String, Value>> = self.doc_read(key, "zset").await?;
        if exists.is_none() {
            return Ok(0);
        }
        self.doc_rmw(key, "zset", move |doc| {
            let mut removed = 0u64;
            for member in &members {
                if doc.remove(member).is_some() {
                    removed += 1;
                }
            }
            removed
        })
        .await
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        Ok(self
            .doc_read(key, "zset")
            .await?
            .map(|doc| doc.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn id_rule_counts_within_one_millisecond() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        let a = store.log_append("log", &fields(&[("n", "1")]), 100).await.unwrap();
        let b = store.log_append("log", &fields(&[("n", "2")]), 100).await.unwrap();
        let (a_ms, a_seq) = parse_entry_id(&a).unwrap();
        let (b_ms, b_seq) = parse_entry_id(&b).unwrap();
        assert!((b_ms, b_seq) > (a_ms, a_seq));
        if a_ms == b_ms {
            assert_eq!(b_seq, a_seq + 1);
        }
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn read_marks_pending_and_ack_clears_it() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        store.group_create("log", "sub:s", "0").await.unwrap();
        store.log_append("log", &fields(&[("n", "1")]), 100).await.unwrap();

        let read = store.group_read("log", "sub:s", "c1", 0, 10).await.unwrap();
        assert_eq!(read.len(), 1);

        let pending = store.group_pending("log", "sub:s", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[0].deliveries, 1);

        assert_eq!(
            store.group_ack("log", "sub:s", &[read[0].id.as_str()]).await.unwrap(),
            1
        );
        assert!(store.group_pending("log", "sub:s", 10).await.unwrap().is_empty());
        // Acked entries are never redelivered to the group.
        assert!(store.group_read("log", "sub:s", "c2", 0, 10).await.unwrap().is_empty());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn reclaim_respects_idle_threshold() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        store.group_create("log", "g", "0").await.unwrap();
        store.log_append("log", &fields(&[("n", "1")]), 100).await.unwrap();
        store.group_read("log", "g", "c1", 0, 10).await.unwrap();

        assert!(store.group_reclaim("log", "g", "c2", 60_000, 10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = store.group_reclaim("log", "g", "c2", 20, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        let pending = store.group_pending("log", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].deliveries, 2);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn blocking_read_polls_once() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        store.group_create("log", "g", "0").await.unwrap();

        let start = std::time::Instant::now();
        let read = store.group_read("log", "g", "c1", 200, 10).await.unwrap();
        assert!(read.is_empty());
        // Slept roughly one capped block interval, not zero and not forever.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(2_000));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_group_creation_is_a_distinct_error() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        store.group_create("log", "g", "0").await.unwrap();
        assert!(matches!(
            store.group_create("log", "g", "0").await,
            Err(StoreError::GroupAlreadyExists { .. })
        ));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn trim_deletes_oldest_documents() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        for n in 0..6 {
            store
                .log_append("log", &fields(&[("n", &n.to_string())]), 4)
                .await
                .unwrap();
        }
        assert_eq!(store.log_len("log").await.unwrap(), 4);
        let range = store.log_range("log", RANGE_MIN, RANGE_MAX, 10).await.unwrap();
        assert_eq!(range[0].fields["n"], "2");
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn kv_ttl_rows_expire_for_readers() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        store.kv_set("k", Bytes::from_static(b"v"), Some(1)).await.unwrap();
        assert!(store.kv_get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(store.kv_get("k").await.unwrap().is_none());
        assert_eq!(store.kv_exists(&["k"]).await.unwrap(), 0);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn hash_and_zset_documents() {
        let store = SqliteHotStore::connect_in_memory().await.unwrap();
        store.hash_set("h", "config", "{\"a\":1}").await.unwrap();
        assert_eq!(
            store.hash_get("h", "config").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert!(store.hash_get("h", "missing").await.unwrap().is_none());

        store.zset_add("z", 20, "b").await.unwrap();
        store.zset_add("z", 10, "a").await.unwrap();
        assert_eq!(
            store.zset_range_by_score("z", 0, 15, 10).await.unwrap(),
            vec!["a".to_string()]
        );
        assert_eq!(store.zset_remove("z", &["a"]).await.unwrap(), 1);
        assert_eq!(store.zset_card("z").await.unwrap(), 1);

        // Kind mismatch is a distinct error.
        assert!(matches!(
            store.hash_get("z", "x").await,
            Err(StoreError::WrongKind { .. })
        ));
        store.close().await.unwrap();
    }
}
