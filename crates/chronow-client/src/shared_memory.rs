//! Dual-tier shared-memory engine.
//!
//! Values live in the hot tier with a bounded TTL and are optionally
//! mirrored to the warm tier; reads fall back to the warm copy when the hot
//! entry has expired. The warm tier is the source of truth for durability -
//! the hot tier is a fast cache with a bounded lifetime.

use chronow_core::{codec, Scope};
use chronow_store::{SharedMemoryDoc, SystemMeta};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::{now_ms, Shared};

/// How a warm mirror write is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertStrategy {
    /// Insert a fresh versioned row per write; reads see the newest.
    Append,
    /// Keep exactly one row per identity, updated in place.
    #[default]
    Latest,
}

/// Warm-mirror settings for a `set`.
#[derive(Debug, Clone, Default)]
pub struct WarmWrite {
    pub strategy: UpsertStrategy,
    pub retention_days: Option<u32>,
}

/// Options for [`SharedMemory::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub scope: Scope,
    /// Hot-tier TTL in seconds; unlimited when absent.
    pub hot_ttl_sec: Option<u64>,
    /// Mirror the value to the warm tier.
    pub warm: Option<WarmWrite>,
    /// Override of the encoded-size limit (defaults to the broker's
    /// `max_payload_bytes`).
    pub max_value_bytes: Option<usize>,
}

/// Dual-tier KV engine.
pub struct SharedMemory {
    shared: Arc<Shared>,
}

impl SharedMemory {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Store `value` in the hot tier (with TTL) and, when requested, mirror
    /// it to the warm tier.
    pub async fn set(&self, name: &str, value: &Value, options: SetOptions) -> Result<()> {
        let max = options
            .max_value_bytes
            .unwrap_or(self.shared.config.max_payload_bytes);
        let encoded = codec::encode_payload(value, max)?;

        let key = self.shared.keys.shared_memory(&options.scope, name);
        self.shared
            .hot
            .kv_set(&key, encoded.into_bytes(), options.hot_ttl_sec)
            .await?;

        if let Some(warm) = &options.warm {
            let now = now_ms();
            let doc = SharedMemoryDoc {
                key: name.to_string(),
                namespace: options.scope.namespace.clone(),
                tenant: options.scope.tenant.clone(),
                value: Some(value.clone()),
                system: SystemMeta {
                    created_at: now,
                    updated_at: now,
                    retention_days: warm.retention_days,
                    tombstone: None,
                    deleted_at: None,
                },
            };
            match warm.strategy {
                UpsertStrategy::Append => self.shared.warm.append_shared_memory(&doc).await?,
                UpsertStrategy::Latest => self.shared.warm.upsert_shared_memory(&doc).await?,
            }
        }
        Ok(())
    }

    /// Read a value: hot tier first, warm tier on miss. Tombstoned warm
    /// documents read as absent.
    pub async fn get(&self, name: &str, scope: &Scope) -> Result<Option<Value>> {
        let key = self.shared.keys.shared_memory(scope, name);
        if let Some(bytes) = self.shared.hot.kv_get(&key).await? {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Ok(Some(value)),
                Err(error) => {
                    warn!(%key, %error, "hot shared-memory value is corrupt; falling back to warm");
                }
            }
        }

        let doc = self
            .shared
            .warm
            .find_shared_memory(&scope.tenant, &scope.namespace, name)
            .await?;
        match doc {
            Some(doc) if doc.system.tombstone != Some(true) => {
                debug!(%key, "shared-memory read served from warm tier");
                Ok(doc.value)
            }
            _ => Ok(None),
        }
    }

    /// Delete the hot entry; when `tombstone` is set, also mark the warm
    /// copy deleted so read-through misses too.
    pub async fn del(&self, name: &str, scope: &Scope, tombstone: bool) -> Result<u64> {
        let key = self.shared.keys.shared_memory(scope, name);
        let removed = self.shared.hot.kv_del(&[key.as_str()]).await?;

        if tombstone {
            let now = now_ms();
            self.shared
                .warm
                .upsert_shared_memory(&SharedMemoryDoc {
                    key: name.to_string(),
                    namespace: scope.namespace.clone(),
                    tenant: scope.tenant.clone(),
                    value: None,
                    system: SystemMeta {
                        created_at: now,
                        updated_at: now,
                        retention_days: None,
                        tombstone: Some(true),
                        deleted_at: Some(now),
                    },
                })
                .await?;
        }
        Ok(removed)
    }

    /// Whether the hot entry currently exists.
    pub async fn exists(&self, name: &str, scope: &Scope) -> Result<bool> {
        let key = self.shared.keys.shared_memory(scope, name);
        Ok(self.shared.hot.kv_exists(&[key.as_str()]).await? == 1)
    }

    /// Set a TTL on the hot entry; `false` when it is absent.
    pub async fn expire(&self, name: &str, ttl_sec: u64, scope: &Scope) -> Result<bool> {
        let key = self.shared.keys.shared_memory(scope, name);
        Ok(self.shared.hot.kv_expire(&key, ttl_sec).await?)
    }
}
