//! Delayed requeue via a sorted-set scored by next-attempt time.
//!
//! A nacked-with-requeue message is serialized into a retry entry and added
//! to the subscription's retry set, scored by the moment it becomes due.
//! Consumers drain ready entries back into the topic log at the top of each
//! loop iteration.
//!
//! Entries are removed by their exact serialized string, so the drain path
//! always removes the raw member it read - never a re-serialization.

use chronow_core::Scope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::{now_ms, Shared};

/// Fallback base delay when a subscription carries an empty backoff ladder.
const FALLBACK_DELAY_MS: u64 = 1_000;

/// A scheduled redelivery, as serialized into the retry set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub original_id: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    /// 1-based delivery count at the time of scheduling.
    pub attempt: u32,
    pub next_attempt_ms: i64,
}

/// Schedules and drains delayed redeliveries.
pub struct RetryScheduler {
    shared: Arc<Shared>,
}

impl RetryScheduler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn key(&self, topic: &str, subscription: &str, scope: &Scope) -> String {
        self.shared.keys.retry(scope, topic, subscription)
    }

    /// Base delay for a 1-based delivery attempt: the ladder entry for the
    /// attempt, saturating at the last rung.
    pub fn backoff_delay(backoff: &[u64], attempt: u32) -> u64 {
        if backoff.is_empty() {
            return FALLBACK_DELAY_MS;
        }
        let index = (attempt.saturating_sub(1) as usize).min(backoff.len() - 1);
        backoff[index]
    }

    /// `base` plus up to 20% random jitter.
    fn jittered(base: u64) -> u64 {
        let spread = base / 5;
        if spread == 0 {
            return base;
        }
        base + rand::random::<u64>() % (spread + 1)
    }

    /// Schedule a redelivery for `attempt` (the 1-based delivery count).
    /// `delay_ms` overrides the backoff ladder when present.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn schedule(
        &self,
        topic: &str,
        subscription: &str,
        scope: &Scope,
        original_id: &str,
        payload: Value,
        headers: HashMap<String, String>,
        attempt: u32,
        backoff: &[u64],
        delay_ms: Option<u64>,
    ) -> Result<()> {
        let base = delay_ms.unwrap_or_else(|| Self::backoff_delay(backoff, attempt));
        let delay = Self::jittered(base);
        let next_attempt_ms = now_ms() + delay as i64;

        let entry = RetryEntry {
            original_id: original_id.to_string(),
            payload,
            headers,
            attempt,
            next_attempt_ms,
        };
        let member = serde_json::to_string(&entry).map_err(chronow_core::CoreError::from)?;
        self.shared
            .hot
            .zset_add(&self.key(topic, subscription, scope), next_attempt_ms, &member)
            .await?;
        debug!(topic, subscription, original_id, attempt, delay, "retry scheduled");
        Ok(())
    }

    /// Entries due now, oldest-due first, paired with the raw member string
    /// needed to remove them.
    pub(crate) async fn drain_ready(
        &self,
        topic: &str,
        subscription: &str,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<(String, RetryEntry)>> {
        let members = self
            .shared
            .hot
            .zset_range_by_score(
                &self.key(topic, subscription, scope),
                i64::MIN,
                now_ms(),
                limit,
            )
            .await?;

        let mut ready = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<RetryEntry>(&member) {
                Ok(entry) => ready.push((member, entry)),
                Err(error) => {
                    // A member that cannot be decoded would wedge the drain
                    // forever; drop it.
                    tracing::warn!(topic, subscription, %error, "dropping undecodable retry entry");
                    self.shared
                        .hot
                        .zset_remove(&self.key(topic, subscription, scope), &[member.as_str()])
                        .await?;
                }
            }
        }
        Ok(ready)
    }

    /// Remove a drained entry by the exact raw member string.
    pub(crate) async fn remove(
        &self,
        topic: &str,
        subscription: &str,
        scope: &Scope,
        raw_member: &str,
    ) -> Result<u64> {
        Ok(self
            .shared
            .hot
            .zset_remove(&self.key(topic, subscription, scope), &[raw_member])
            .await?)
    }

    /// Number of redeliveries currently scheduled for the subscription.
    pub async fn scheduled_count(
        &self,
        topic: &str,
        subscription: &str,
        scope: &Scope,
    ) -> Result<u64> {
        Ok(self
            .shared
            .hot
            .zset_card(&self.key(topic, subscription, scope))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_saturates_at_last_rung() {
        let backoff = [100, 200, 400];
        assert_eq!(RetryScheduler::backoff_delay(&backoff, 1), 100);
        assert_eq!(RetryScheduler::backoff_delay(&backoff, 2), 200);
        assert_eq!(RetryScheduler::backoff_delay(&backoff, 3), 400);
        assert_eq!(RetryScheduler::backoff_delay(&backoff, 9), 400);
        // Attempt 0 is treated like the first attempt.
        assert_eq!(RetryScheduler::backoff_delay(&backoff, 0), 100);
    }

    #[test]
    fn empty_ladder_falls_back() {
        assert_eq!(RetryScheduler::backoff_delay(&[], 3), FALLBACK_DELAY_MS);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..200 {
            let delay = RetryScheduler::jittered(100);
            assert!((100..=120).contains(&delay));
        }
        // Bases too small to jitter pass through unchanged.
        assert_eq!(RetryScheduler::jittered(3), 3);
    }

    #[test]
    fn entry_serialization_is_stable() {
        let entry = RetryEntry {
            original_id: "1-0".to_string(),
            payload: serde_json::json!({"id": "B"}),
            headers: HashMap::new(),
            attempt: 1,
            next_attempt_ms: 42,
        };
        let a = serde_json::to_string(&entry).unwrap();
        let b = serde_json::to_string(&entry).unwrap();
        assert_eq!(a, b);
        let back: RetryEntry = serde_json::from_str(&a).unwrap();
        assert_eq!(back, entry);
    }
}
