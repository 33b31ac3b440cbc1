//! Consumer loop and per-message handles.
//!
//! A [`Subscriber`] is bound to `(topic, subscription, consumer-id)`. Each
//! [`Subscriber::poll`] performs one loop iteration, in this order:
//!
//! 1. **Drain** ready retry entries back into the topic log (they re-enter
//!    as fresh entries carrying `retry_of`).
//! 2. **Reclaim** entries whose in-flight time exceeded the subscription's
//!    visibility timeout, taking them over from stalled consumers.
//! 3. **Read** new entries for the group, blocking up to the subscription's
//!    `block_ms`.
//! 4. **Dispatch** each reclaimed or read entry as a [`Message`] handle.
//!
//! Internal failures in steps 1–3 are logged and swallowed; the loop
//! retries them on its next iteration. Entries whose payload or headers
//! cannot be decoded are acked and dropped so they cannot poison the loop.
//!
//! Delivery counters are per-process, keyed by the *original* message id
//! (`retry_of` when the entry is a redelivery), so counts accumulate across
//! requeue cycles within one process. After a failover the new process
//! starts counting from zero - the delivery bound is best-effort across
//! process boundaries.

use chronow_core::{KeySpace, Scope, SubscriptionConfig};
use chronow_store::LogEntry;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::dead_letter::DeadLetterSink;
use crate::error::{ChronowError, Result};
use crate::retry::RetryScheduler;
use crate::topics::TopicManager;
use crate::{entry_fields, now_ms, Shared};

/// Entries drained from the retry set per iteration.
const DRAIN_LIMIT: usize = 10;

/// Entries reclaimed from stalled consumers per iteration.
const RECLAIM_LIMIT: usize = 10;

/// Reason recorded when the delivery budget is exhausted.
const MAX_DELIVERIES_REASON: &str = "Max deliveries exceeded";

/// Reason recorded for explicit `dead_letter()` calls without one.
const MANUAL_REASON: &str = "Manual dead-letter";

/// Options for [`crate::Chronow::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub scope: Scope,
    /// Stable consumer identity; synthesized when absent.
    pub consumer_id: Option<String>,
}

/// Options for [`Message::nack`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NackOptions {
    /// Schedule a delayed redelivery. Without it the entry simply stays in
    /// flight until the visibility timeout expires and some consumer
    /// reclaims it.
    pub requeue: bool,
    /// Override the backoff ladder for this requeue.
    pub delay_ms: Option<u64>,
}

struct ConsumerCtx {
    shared: Arc<Shared>,
    scope: Scope,
    topic: String,
    subscription: String,
    consumer_id: String,
    config: SubscriptionConfig,
    log_key: String,
    group: String,
    /// Original-message-id → deliveries observed by this loop.
    counts: Mutex<HashMap<String, u32>>,
    retry: RetryScheduler,
    dlq: DeadLetterSink,
}

impl ConsumerCtx {
    fn count_of(&self, original_id: &str) -> u32 {
        self.counts
            .lock()
            .expect("delivery counter lock poisoned")
            .get(original_id)
            .copied()
            .unwrap_or(1)
    }

    fn forget(&self, original_id: &str) {
        self.counts
            .lock()
            .expect("delivery counter lock poisoned")
            .remove(original_id);
    }

    async fn ack_entry(&self, id: &str) -> Result<()> {
        self.shared
            .hot
            .group_ack(&self.log_key, &self.group, &[id])
            .await?;
        Ok(())
    }
}

/// A consumer bound to one `(topic, subscription)`.
pub struct Subscriber {
    ctx: Arc<ConsumerCtx>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.ctx.topic)
            .field("subscription", &self.ctx.subscription)
            .field("consumer_id", &self.ctx.consumer_id)
            .finish()
    }
}

impl Subscriber {
    pub(crate) async fn attach(
        shared: Arc<Shared>,
        topic: &str,
        subscription: &str,
        options: SubscribeOptions,
    ) -> Result<Self> {
        let manager = TopicManager::new(Arc::clone(&shared));
        let state = manager
            .subscription_state(topic, subscription, &options.scope)
            .await?
            .ok_or_else(|| ChronowError::SubscriptionNotFound {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
            })?;

        let consumer_id = options
            .consumer_id
            .unwrap_or_else(|| format!("consumer-{}-{:08x}", now_ms(), rand::random::<u32>()));
        let log_key = shared.keys.topic(&options.scope, topic);
        debug!(topic, subscription, consumer_id, "consumer attached");

        Ok(Self {
            ctx: Arc::new(ConsumerCtx {
                scope: options.scope,
                topic: topic.to_string(),
                subscription: subscription.to_string(),
                consumer_id,
                config: state.config,
                log_key,
                group: KeySpace::group(subscription),
                counts: Mutex::new(HashMap::new()),
                retry: RetryScheduler::new(Arc::clone(&shared)),
                dlq: DeadLetterSink::new(Arc::clone(&shared)),
                shared,
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.ctx.topic
    }

    pub fn subscription(&self) -> &str {
        &self.ctx.subscription
    }

    pub fn consumer_id(&self) -> &str {
        &self.ctx.consumer_id
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.ctx.config
    }

    /// One loop iteration: drain, reclaim, read, dispatch. Returns the batch
    /// of message handles (possibly empty).
    pub async fn poll(&self) -> Result<Vec<Message>> {
        if let Err(error) = self.drain_retries().await {
            warn!(topic = %self.ctx.topic, %error, "retry drain failed; will retry next iteration");
        }

        let mut entries = match self.reclaim_expired().await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(topic = %self.ctx.topic, %error, "reclaim failed; will retry next iteration");
                Vec::new()
            }
        };

        match self.read_new().await {
            Ok(mut fresh) => entries.append(&mut fresh),
            Err(error) => {
                warn!(topic = %self.ctx.topic, %error, "group read failed; will retry next iteration");
            }
        }

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(message) = self.dispatch(entry).await {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Drive `poll` forever, handing every message to `handler`. Returns
    /// only when the handler fails.
    pub async fn run<F, Fut>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(Message) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            for message in self.poll().await? {
                handler(message).await?;
            }
        }
    }

    /// Step 1: move due retry entries back into the topic log. The original
    /// id stays acked; the payload re-enters as a new entry tagged
    /// `retry_of`.
    async fn drain_retries(&self) -> Result<()> {
        let ctx = &self.ctx;
        let ready = ctx
            .retry
            .drain_ready(&ctx.topic, &ctx.subscription, &ctx.scope, DRAIN_LIMIT)
            .await?;

        for (raw_member, entry) in ready {
            let fields = HashMap::from([
                (
                    entry_fields::PAYLOAD.to_string(),
                    serde_json::to_string(&entry.payload).map_err(chronow_core::CoreError::from)?,
                ),
                (
                    entry_fields::HEADERS.to_string(),
                    serde_json::to_string(&entry.headers).map_err(chronow_core::CoreError::from)?,
                ),
                (entry_fields::RETRY_OF.to_string(), entry.original_id.clone()),
                (entry_fields::ATTEMPT.to_string(), entry.attempt.to_string()),
            ]);
            if let Err(error) = ctx
                .shared
                .hot
                .log_append(&ctx.log_key, &fields, ctx.shared.config.max_stream_len)
                .await
            {
                // Leave the member scheduled; the next drain retries it.
                warn!(original_id = %entry.original_id, %error, "retry re-append failed");
                continue;
            }
            ctx.retry
                .remove(&ctx.topic, &ctx.subscription, &ctx.scope, &raw_member)
                .await?;
            debug!(original_id = %entry.original_id, attempt = entry.attempt, "retry drained into log");
        }
        Ok(())
    }

    /// Step 2: take over entries whose visibility timeout expired.
    async fn reclaim_expired(&self) -> Result<Vec<LogEntry>> {
        let ctx = &self.ctx;
        Ok(ctx
            .shared
            .hot
            .group_reclaim(
                &ctx.log_key,
                &ctx.group,
                &ctx.consumer_id,
                ctx.config.visibility_timeout_ms,
                RECLAIM_LIMIT,
            )
            .await?)
    }

    /// Step 3: read never-delivered entries for this group.
    async fn read_new(&self) -> Result<Vec<LogEntry>> {
        let ctx = &self.ctx;
        Ok(ctx
            .shared
            .hot
            .group_read(
                &ctx.log_key,
                &ctx.group,
                &ctx.consumer_id,
                ctx.config.block_ms,
                ctx.config.count_per_read,
            )
            .await?)
    }

    /// Step 4: decode one entry into a handle, tracking its delivery count.
    /// Undecodable entries are acked and dropped.
    async fn dispatch(&self, entry: LogEntry) -> Option<Message> {
        let ctx = &self.ctx;

        let decoded = entry
            .fields
            .get(entry_fields::PAYLOAD)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .zip(
                entry
                    .fields
                    .get(entry_fields::HEADERS)
                    .and_then(|raw| serde_json::from_str::<HashMap<String, String>>(raw).ok()),
            );
        let Some((payload, base_headers)) = decoded else {
            warn!(id = %entry.id, "dropping undecodable entry to avoid a poison-pill loop");
            if let Err(error) = ctx.ack_entry(&entry.id).await {
                warn!(id = %entry.id, %error, "could not ack undecodable entry");
            }
            return None;
        };

        let retry_of = entry.fields.get(entry_fields::RETRY_OF).cloned();
        let attempt = entry.fields.get(entry_fields::ATTEMPT).cloned();
        let original_id = retry_of.clone().unwrap_or_else(|| entry.id.clone());

        let redelivery_count = {
            let mut counts = ctx.counts.lock().expect("delivery counter lock poisoned");
            let seen = counts.get(&original_id).copied().unwrap_or(0);
            counts.insert(original_id.clone(), seen + 1);
            seen
        };

        let mut headers = base_headers.clone();
        if let Some(retry_of) = &retry_of {
            headers.insert(entry_fields::RETRY_OF.to_string(), retry_of.clone());
        }
        if let Some(attempt) = &attempt {
            headers.insert(entry_fields::ATTEMPT.to_string(), attempt.clone());
        }

        Some(Message {
            id: entry.id,
            payload,
            headers,
            redelivery_count,
            original_id,
            base_headers,
            ctx: Arc::clone(ctx),
            terminal: AtomicBool::new(false),
        })
    }
}

/// Handle to one delivered message.
///
/// `ack`, `nack`, and `dead_letter` are one-shot between them: the first
/// call consumes the handle's terminal slot, later calls are logged no-ops.
pub struct Message {
    /// Log entry id of this delivery (a retry re-append gets a fresh id).
    pub id: String,
    pub payload: Value,
    /// Message headers; redeliveries additionally carry `retry_of` and
    /// `attempt`.
    pub headers: HashMap<String, String>,
    /// Deliveries of this message observed by this loop before the current
    /// one.
    pub redelivery_count: u32,
    original_id: String,
    base_headers: HashMap<String, String>,
    ctx: Arc<ConsumerCtx>,
    terminal: AtomicBool,
}

impl Message {
    pub fn topic(&self) -> &str {
        &self.ctx.topic
    }

    pub fn subscription(&self) -> &str {
        &self.ctx.subscription
    }

    /// Id of the first delivery of this message (differs from `id` on
    /// redeliveries).
    pub fn original_id(&self) -> &str {
        &self.original_id
    }

    fn take_terminal(&self, op: &str) -> bool {
        if self.terminal.swap(true, Ordering::SeqCst) {
            debug!(id = %self.id, op, "ignoring repeated terminal call on message handle");
            return false;
        }
        true
    }

    /// Acknowledge: the message is done and never redelivered.
    pub async fn ack(&self) -> Result<()> {
        if !self.take_terminal("ack") {
            return Ok(());
        }
        self.ctx.ack_entry(&self.id).await?;
        self.ctx.forget(&self.original_id);
        Ok(())
    }

    /// Negative-acknowledge.
    ///
    /// - Delivery budget exhausted: the message is dead-lettered (when the
    ///   subscription enables it) and acked.
    /// - `requeue`: a delayed redelivery is scheduled and the current entry
    ///   acked - the drain step re-injects the payload later.
    /// - Otherwise nothing happens; the entry stays in flight and is
    ///   reclaimed by some consumer after the visibility timeout.
    pub async fn nack(&self, options: NackOptions) -> Result<()> {
        if !self.take_terminal("nack") {
            return Ok(());
        }
        let ctx = &self.ctx;
        let deliveries = ctx.count_of(&self.original_id);

        if deliveries >= ctx.config.max_deliveries {
            if ctx.config.dead_letter_enabled {
                ctx.dlq
                    .send(
                        &ctx.topic,
                        &ctx.scope,
                        &self.original_id,
                        &self.payload,
                        &self.base_headers,
                        MAX_DELIVERIES_REASON,
                        deliveries,
                    )
                    .await?;
            } else {
                warn!(
                    id = %self.id,
                    deliveries,
                    "delivery budget exhausted with dead-lettering disabled; dropping message"
                );
            }
            ctx.ack_entry(&self.id).await?;
            ctx.forget(&self.original_id);
            return Ok(());
        }

        if options.requeue {
            ctx.retry
                .schedule(
                    &ctx.topic,
                    &ctx.subscription,
                    &ctx.scope,
                    &self.original_id,
                    self.payload.clone(),
                    self.base_headers.clone(),
                    deliveries,
                    &ctx.config.retry_backoff_ms,
                    options.delay_ms,
                )
                .await?;
            // The payload now lives in the retry set; the counter stays so
            // the redelivery continues the count.
            ctx.ack_entry(&self.id).await?;
        }
        Ok(())
    }

    /// Explicitly dead-letter this message, regardless of delivery count.
    pub async fn dead_letter(&self, reason: Option<&str>) -> Result<()> {
        if !self.take_terminal("dead_letter") {
            return Ok(());
        }
        let ctx = &self.ctx;
        let deliveries = ctx.count_of(&self.original_id);
        ctx.dlq
            .send(
                &ctx.topic,
                &ctx.scope,
                &self.original_id,
                &self.payload,
                &self.base_headers,
                reason.unwrap_or(MANUAL_REASON),
                deliveries,
            )
            .await?;
        ctx.ack_entry(&self.id).await?;
        ctx.forget(&self.original_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronow_core::{ChronowConfig, KeySpace};
    use chronow_store::{MemoryHotStore, NullWarmStore};

    fn test_ctx() -> Arc<ConsumerCtx> {
        let shared = Arc::new(Shared {
            hot: Arc::new(MemoryHotStore::new()),
            warm: Arc::new(NullWarmStore),
            keys: KeySpace::default(),
            config: ChronowConfig::default(),
        });
        Arc::new(ConsumerCtx {
            scope: Scope::default(),
            topic: "orders".to_string(),
            subscription: "s".to_string(),
            consumer_id: "c1".to_string(),
            config: SubscriptionConfig::default(),
            log_key: "cw:default:msg:topic:orders".to_string(),
            group: "sub:s".to_string(),
            counts: Mutex::new(HashMap::new()),
            retry: RetryScheduler::new(Arc::clone(&shared)),
            dlq: DeadLetterSink::new(Arc::clone(&shared)),
            shared,
        })
    }

    fn test_message(ctx: Arc<ConsumerCtx>) -> Message {
        Message {
            id: "1-0".to_string(),
            payload: serde_json::json!({"id": "A"}),
            headers: HashMap::new(),
            redelivery_count: 0,
            original_id: "1-0".to_string(),
            base_headers: HashMap::new(),
            ctx,
            terminal: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn terminal_operations_are_one_shot() {
        let message = test_message(test_ctx());
        assert!(message.take_terminal("ack"));
        assert!(!message.take_terminal("nack"));
        assert!(!message.take_terminal("dead_letter"));
    }

    #[tokio::test]
    async fn repeated_ack_is_a_no_op() {
        let message = test_message(test_ctx());
        message.ack().await.unwrap();
        message.ack().await.unwrap();
        message.nack(NackOptions::default()).await.unwrap();
    }

    #[test]
    fn synthesized_consumer_ids_are_distinct() {
        let a = format!("consumer-{}-{:08x}", now_ms(), rand::random::<u32>());
        let b = format!("consumer-{}-{:08x}", now_ms(), rand::random::<u32>());
        assert_ne!(a, b);
        assert!(a.starts_with("consumer-"));
    }
}
