//! SQLite-backed warm store.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;
use crate::warm::{DeadLetterDoc, MessageDoc, SharedMemoryDoc, SystemMeta, TopicDoc, WarmStore};

const SCHEMA: &[&str] = &[
    // No unique index: the `append` strategy versions rows on purpose;
    // `find` returns the newest by insertion order.
    "CREATE TABLE IF NOT EXISTS shared_memory (
        key            TEXT NOT NULL,
        namespace      TEXT NOT NULL,
        tenant         TEXT NOT NULL,
        value          TEXT,
        retention_days INTEGER,
        tombstone      INTEGER NOT NULL DEFAULT 0,
        deleted_at     INTEGER,
        created_at     INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sm_identity ON shared_memory(tenant, namespace, key)",
    "CREATE TABLE IF NOT EXISTS topics (
        topic      TEXT NOT NULL,
        tenant     TEXT NOT NULL,
        shards     INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (topic, tenant)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        topic         TEXT NOT NULL,
        msg_id        TEXT NOT NULL,
        tenant        TEXT NOT NULL,
        headers       TEXT NOT NULL,
        payload       TEXT NOT NULL,
        first_seen_at TEXT NOT NULL,
        size          INTEGER NOT NULL,
        created_at    INTEGER NOT NULL,
        PRIMARY KEY (topic, msg_id, tenant)
    )",
    "CREATE TABLE IF NOT EXISTS dead_letters (
        topic      TEXT NOT NULL,
        msg_id     TEXT NOT NULL,
        tenant     TEXT NOT NULL,
        reason     TEXT NOT NULL,
        headers    TEXT NOT NULL,
        payload    TEXT NOT NULL,
        failed_at  TEXT NOT NULL,
        deliveries INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_dlq_topic ON dead_letters(tenant, topic)",
];

/// Durable [`WarmStore`] over SQLite.
pub struct SqliteWarmStore {
    pool: SqlitePool,
}

impl SqliteWarmStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
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
        Ok(Self { pool })
    }

    pub async fn connect_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    fn decode_shared_memory(
        row: (String, String, String, Option<String>, Option<i64>, i64, Option<i64>, i64, i64),
    ) -> Result<SharedMemoryDoc> {
        let (key, namespace, tenant, value, retention_days, tombstone, deleted_at, created_at, updated_at) =
            row;
        Ok(SharedMemoryDoc {
            key,
            namespace,
            tenant,
            value: value.map(|raw| serde_json::from_str(&raw)).transpose()?,
            system: SystemMeta {
                created_at,
                updated_at,
                retention_days: retention_days.map(|d| d as u32),
                tombstone: (tombstone != 0).then_some(true),
                deleted_at,
            },
        })
    }
}

#[async_trait]
impl WarmStore for SqliteWarmStore {
    async fn upsert_shared_memory(&self, doc: &SharedMemoryDoc) -> Result<()> {
        let value = doc
            .value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tombstone = doc.system.tombstone.unwrap_or(false) as i64;

        let updated = sqlx::query(
            "UPDATE shared_memory SET
                 value = ?4, retention_days = ?5, tombstone = ?6, deleted_at = ?7, updated_at = ?8
             WHERE tenant = ?1 AND namespace = ?2 AND key = ?3",
        )
        .bind(&doc.tenant)
        .bind(&doc.namespace)
        .bind(&doc.key)
        .bind(&value)
        .bind(doc.system.retention_days.map(|d| d as i64))
        .bind(tombstone)
        .bind(doc.system.deleted_at)
        .bind(doc.system.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            self.append_shared_memory(doc).await?;
        }
        Ok(())
    }

    async fn append_shared_memory(&self, doc: &SharedMemoryDoc) -> Result<()> {
        let value = doc
            .value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO shared_memory
                 (key, namespace, tenant, value, retention_days, tombstone, deleted_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&doc.key)
        .bind(&doc.namespace)
        .bind(&doc.tenant)
        .bind(&value)
        .bind(doc.system.retention_days.map(|d| d as i64))
        .bind(doc.system.tombstone.unwrap_or(false) as i64)
        .bind(doc.system.deleted_at)
        .bind(doc.system.created_at)
        .bind(doc.system.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_shared_memory(
        &self,
        tenant: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<SharedMemoryDoc>> {
        let row: Option<(String, String, String, Option<String>, Option<i64>, i64, Option<i64>, i64, i64)> =
            sqlx::query_as(
                "SELECT key, namespace, tenant, value, retention_days, tombstone, deleted_at,
                        created_at, updated_at
                 FROM shared_memory
                 WHERE tenant = ?1 AND namespace = ?2 AND key = ?3
                 ORDER BY rowid DESC LIMIT 1",
            )
            .bind(tenant)
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::decode_shared_memory).transpose()
    }

    async fn upsert_topic(&self, doc: &TopicDoc) -> Result<()> {
        sqlx::query(
            "INSERT INTO topics (topic, tenant, shards, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(topic, tenant) DO UPDATE SET
                 shards = excluded.shards,
                 updated_at = excluded.updated_at",
        )
        .bind(&doc.topic)
        .bind(&doc.tenant)
        .bind(doc.shards as i64)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_message(&self, doc: &MessageDoc) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages
                 (topic, msg_id, tenant, headers, payload, first_seen_at, size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&doc.topic)
        .bind(&doc.msg_id)
        .bind(&doc.tenant)
        .bind(serde_json::to_string(&doc.headers)?)
        .bind(serde_json::to_string(&doc.payload)?)
        .bind(&doc.first_seen_at)
        .bind(doc.size as i64)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_message(
        &self,
        tenant: &str,
        topic: &str,
        msg_id: &str,
    ) -> Result<Option<MessageDoc>> {
        let row: Option<(String, String, String, String, String, String, i64, i64)> =
            sqlx::query_as(
                "SELECT topic, msg_id, tenant, headers, payload, first_seen_at, size, created_at
                 FROM messages WHERE tenant = ?1 AND topic = ?2 AND msg_id = ?3",
            )
            .bind(tenant)
            .bind(topic)
            .bind(msg_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(
            |(topic, msg_id, tenant, headers, payload, first_seen_at, size, created_at)| {
                Ok(MessageDoc {
                    topic,
                    msg_id,
                    tenant,
                    headers: serde_json::from_str::<HashMap<String, String>>(&headers)?,
                    payload: serde_json::from_str(&payload)?,
                    first_seen_at,
                    size: size as u64,
                    created_at,
                })
            },
        )
        .transpose()
    }

    async fn insert_dead_letter(&self, doc: &DeadLetterDoc) -> Result<()> {
        sqlx::query(
            "INSERT INTO dead_letters
                 (topic, msg_id, tenant, reason, headers, payload, failed_at, deliveries, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&doc.topic)
        .bind(&doc.msg_id)
        .bind(&doc.tenant)
        .bind(&doc.reason)
        .bind(serde_json::to_string(&doc.headers)?)
        .bind(serde_json::to_string(&doc.payload)?)
        .bind(&doc.failed_at)
        .bind(doc.deliveries as i64)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_dead_letters(
        &self,
        tenant: &str,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterDoc>> {
        let rows: Vec<(String, String, String, String, String, String, String, i64, i64)> =
            sqlx::query_as(
                "SELECT topic, msg_id, tenant, reason, headers, payload, failed_at, deliveries,
                        created_at
                 FROM dead_letters WHERE tenant = ?1 AND topic = ?2
                 ORDER BY rowid LIMIT ?3",
            )
            .bind(tenant)
            .bind(topic)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(
                |(topic, msg_id, tenant, reason, headers, payload, failed_at, deliveries, created_at)| {
                    Ok(DeadLetterDoc {
                        topic,
                        msg_id,
                        tenant,
                        reason,
                        headers: serde_json::from_str::<HashMap<String, String>>(&headers)?,
                        payload: serde_json::from_str(&payload)?,
                        failed_at,
                        deliveries: deliveries as u32,
                        created_at,
                    })
                },
            )
            .collect()
    }

    async fn delete_dead_letters(&self, tenant: &str, topic: &str) -> Result<u64> {
        Ok(
            sqlx::query("DELETE FROM dead_letters WHERE tenant = ?1 AND topic = ?2")
                .bind(tenant)
                .bind(topic)
                .execute(&self.pool)
                .await?
                .rows_affected(),
        )
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
