//! Dead-letter sink: the append-only queue for messages the broker gave up
//! on, mirrored to the warm tier for durable inspection.

use chronow_core::Scope;
use chronow_store::DeadLetterDoc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::{entry_fields, iso_now, now_ms, Shared};

/// A decoded dead-letter entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub original_msg_id: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub reason: String,
    pub deliveries: u32,
    /// ISO-8601 failure time.
    pub failed_at: String,
}

/// Writes to and inspects a topic's dead-letter queue.
pub struct DeadLetterSink {
    shared: Arc<Shared>,
}

impl DeadLetterSink {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn log_key(&self, topic: &str, scope: &Scope) -> String {
        self.shared.keys.dead_letter(scope, topic)
    }

    /// Record a dead letter in the DLQ log and the warm `dead_letters`
    /// collection.
    pub async fn send(
        &self,
        topic: &str,
        scope: &Scope,
        original_msg_id: &str,
        payload: &Value,
        headers: &HashMap<String, String>,
        reason: &str,
        deliveries: u32,
    ) -> Result<()> {
        let payload_json = serde_json::to_string(payload).map_err(chronow_core::CoreError::from)?;
        let headers_json = serde_json::to_string(headers).map_err(chronow_core::CoreError::from)?;
        let failed_at = iso_now();

        let fields = HashMap::from([
            (
                entry_fields::ORIGINAL_MSG_ID.to_string(),
                original_msg_id.to_string(),
            ),
            (entry_fields::PAYLOAD.to_string(), payload_json),
            (entry_fields::HEADERS.to_string(), headers_json),
            (entry_fields::REASON.to_string(), reason.to_string()),
            (entry_fields::DELIVERIES.to_string(), deliveries.to_string()),
            (entry_fields::FAILED_AT.to_string(), failed_at.clone()),
        ]);
        self.shared
            .hot
            .log_append(
                &self.log_key(topic, scope),
                &fields,
                self.shared.config.max_stream_len,
            )
            .await?;

        self.shared
            .warm
            .insert_dead_letter(&DeadLetterDoc {
                topic: topic.to_string(),
                msg_id: original_msg_id.to_string(),
                tenant: scope.tenant.clone(),
                reason: reason.to_string(),
                headers: headers.clone(),
                payload: payload.clone(),
                failed_at,
                deliveries,
                created_at: now_ms(),
            })
            .await?;

        info!(topic, original_msg_id, reason, deliveries, "message dead-lettered");
        Ok(())
    }

    /// Current DLQ length for a topic.
    pub async fn length(&self, topic: &str, scope: &Scope) -> Result<u64> {
        Ok(self.shared.hot.log_len(&self.log_key(topic, scope)).await?)
    }

    /// Decode up to `limit` dead letters, oldest first. Entries that fail to
    /// decode are skipped with a warning.
    pub async fn peek(
        &self,
        topic: &str,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>> {
        let entries = self
            .shared
            .hot
            .log_range(
                &self.log_key(topic, scope),
                chronow_store::RANGE_MIN,
                chronow_store::RANGE_MAX,
                limit,
            )
            .await?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match Self::decode(&entry.fields) {
                Some(record) => records.push(record),
                None => warn!(topic, id = %entry.id, "skipping undecodable dead-letter entry"),
            }
        }
        Ok(records)
    }

    /// Drop the DLQ log entirely.
    pub async fn purge(&self, topic: &str, scope: &Scope) -> Result<u64> {
        let key = self.log_key(topic, scope);
        Ok(self.shared.hot.kv_del(&[key.as_str()]).await?)
    }

    fn decode(fields: &HashMap<String, String>) -> Option<DeadLetterRecord> {
        Some(DeadLetterRecord {
            original_msg_id: fields.get(entry_fields::ORIGINAL_MSG_ID)?.clone(),
            payload: serde_json::from_str(fields.get(entry_fields::PAYLOAD)?).ok()?,
            headers: serde_json::from_str(fields.get(entry_fields::HEADERS)?).ok()?,
            reason: fields.get(entry_fields::REASON)?.clone(),
            deliveries: fields.get(entry_fields::DELIVERIES)?.parse().ok()?,
            failed_at: fields.get(entry_fields::FAILED_AT)?.clone(),
        })
    }
}
