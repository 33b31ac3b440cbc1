//! Producer: payload-bounded appends with optional warm copies.

use chronow_core::{codec, Scope};
use chronow_store::MessageDoc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::{entry_fields, iso_now, now_ms, Shared};

/// Options for [`Producer::publish`] and [`Producer::publish_batch`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub scope: Scope,
    pub headers: HashMap<String, String>,
    /// Also insert the message into the warm `messages` collection.
    pub persist_warm_copy: bool,
}

/// Appends messages to topic logs.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Publish one payload; returns the assigned message id.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` when the JSON encoding exceeds the broker's
    /// `max_payload_bytes`; the log is untouched in that case.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &Value,
        options: PublishOptions,
    ) -> Result<String> {
        let encoded = codec::encode_payload(payload, self.shared.config.max_payload_bytes)?;
        let id = self
            .append_message(topic, payload, &encoded.json, encoded.size, &options)
            .await?;
        Ok(id)
    }

    /// Publish several payloads to one topic.
    ///
    /// All payloads are size-checked up front: if any exceeds the limit the
    /// whole batch fails and nothing is appended. Warm copies are written
    /// only after every id is known.
    pub async fn publish_batch(
        &self,
        topic: &str,
        payloads: &[Value],
        options: PublishOptions,
    ) -> Result<Vec<String>> {
        let mut encoded = Vec::with_capacity(payloads.len());
        for payload in payloads {
            encoded.push(codec::encode_payload(
                payload,
                self.shared.config.max_payload_bytes,
            )?);
        }

        let log = self.shared.keys.topic(&options.scope, topic);
        let headers_json = serde_json::to_string(&options.headers)
            .map_err(chronow_core::CoreError::from)?;
        let mut ids = Vec::with_capacity(payloads.len());
        for item in &encoded {
            let fields = self.entry(&item.json, item.size, &headers_json);
            ids.push(
                self.shared
                    .hot
                    .log_append(&log, &fields, self.shared.config.max_stream_len)
                    .await?,
            );
        }

        if options.persist_warm_copy {
            for (payload, (item, id)) in payloads.iter().zip(encoded.iter().zip(ids.iter())) {
                self.warm_copy(topic, id, payload, item.size, &options).await?;
            }
        }
        debug!(topic, count = ids.len(), "batch published");
        Ok(ids)
    }

    async fn append_message(
        &self,
        topic: &str,
        payload: &Value,
        payload_json: &str,
        size: usize,
        options: &PublishOptions,
    ) -> Result<String> {
        let log = self.shared.keys.topic(&options.scope, topic);
        let headers_json = serde_json::to_string(&options.headers)
            .map_err(chronow_core::CoreError::from)?;
        let fields = self.entry(payload_json, size, &headers_json);
        let id = self
            .shared
            .hot
            .log_append(&log, &fields, self.shared.config.max_stream_len)
            .await?;

        if options.persist_warm_copy {
            self.warm_copy(topic, &id, payload, size, options).await?;
        }
        Ok(id)
    }

    fn entry(&self, payload_json: &str, size: usize, headers_json: &str) -> HashMap<String, String> {
        HashMap::from([
            (entry_fields::PAYLOAD.to_string(), payload_json.to_string()),
            (entry_fields::HEADERS.to_string(), headers_json.to_string()),
            (
                entry_fields::HASH.to_string(),
                codec::content_hash(payload_json.as_bytes()),
            ),
            (entry_fields::SIZE.to_string(), size.to_string()),
            (entry_fields::PUBLISHED_AT.to_string(), iso_now()),
        ])
    }

    async fn warm_copy(
        &self,
        topic: &str,
        id: &str,
        payload: &Value,
        size: usize,
        options: &PublishOptions,
    ) -> Result<()> {
        self.shared
            .warm
            .insert_message(&MessageDoc {
                topic: topic.to_string(),
                msg_id: id.to_string(),
                tenant: options.scope.tenant.clone(),
                headers: options.headers.clone(),
                payload: payload.clone(),
                first_seen_at: iso_now(),
                size: size as u64,
                created_at: now_ms(),
            })
            .await?;
        Ok(())
    }
}
