//! Shared value types.

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_RETRY_BACKOFF_MS, DEFAULT_VISIBILITY_TIMEOUT_MS};

/// Durable per-subscription configuration.
///
/// Persisted as JSON in the subscription's config hash and reloaded by every
/// consumer; survives process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// How long a delivered-but-unacked entry stays in flight before it is
    /// eligible for reclaim.
    pub visibility_timeout_ms: u64,
    /// Delivery attempts before a message is dead-lettered.
    pub max_deliveries: u32,
    /// Base delays for delayed requeue; attempt `n` (1-based) uses
    /// `retry_backoff_ms[min(n - 1, len - 1)]`.
    pub retry_backoff_ms: Vec<u64>,
    pub dead_letter_enabled: bool,
    /// Tuning knobs.
    pub shard_count: u32,
    pub block_ms: u64,
    pub count_per_read: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_deliveries: 5,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS.to_vec(),
            dead_letter_enabled: true,
            shard_count: 1,
            block_ms: 5_000,
            count_per_read: 10,
        }
    }
}

/// Effective subscription state as persisted: the configuration plus its
/// creation time (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub config: SubscriptionConfig,
    pub created_at: i64,
}

/// Summary returned by topic stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub topic: String,
    /// Current entry count of the topic log.
    pub length: u64,
    /// Number of consumer groups attached to the log.
    pub groups: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_state_round_trips_as_json() {
        let state = SubscriptionState {
            config: SubscriptionConfig {
                visibility_timeout_ms: 1_000,
                max_deliveries: 3,
                retry_backoff_ms: vec![100, 200, 400],
                dead_letter_enabled: true,
                shard_count: 1,
                block_ms: 100,
                count_per_read: 10,
            },
            created_at: 1_700_000_000_000,
        };

        let json = serde_json::to_string(&state).unwrap();
        let back: SubscriptionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
