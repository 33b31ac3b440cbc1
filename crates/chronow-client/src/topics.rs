//! Topic and subscription lifecycle.

use chronow_core::{Scope, SubscriptionConfig, SubscriptionState, TopicStats};
use chronow_store::{PendingEntry, StoreError, TopicDoc};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ChronowError, Result};
use crate::{now_ms, Shared, INIT_GROUP};

/// Field of the config hash holding the serialized subscription state.
const CONFIG_FIELD: &str = "config";

/// Manages topic logs, subscription groups, and persisted subscription
/// configuration.
pub struct TopicManager {
    shared: Arc<Shared>,
}

impl TopicManager {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn log_key(&self, topic: &str, scope: &Scope) -> String {
        self.shared.keys.topic(scope, topic)
    }

    /// Make sure the topic's log exists and its warm row is current.
    ///
    /// The log is materialised through a throwaway group create/destroy
    /// pair - the one sequence both backends implement identically for an
    /// empty log. `already-exists` from a previous ensure is swallowed.
    pub async fn ensure_topic(&self, topic: &str, scope: &Scope) -> Result<()> {
        self.ensure_topic_with_shards(topic, scope, 1).await
    }

    async fn ensure_topic_with_shards(
        &self,
        topic: &str,
        scope: &Scope,
        shards: u32,
    ) -> Result<()> {
        let log = self.log_key(topic, scope);
        match self.shared.hot.group_create(&log, INIT_GROUP, "0").await {
            Ok(()) | Err(StoreError::GroupAlreadyExists { .. }) => {}
            Err(error) => return Err(error.into()),
        }
        self.shared.hot.group_destroy(&log, INIT_GROUP).await?;

        let now = now_ms();
        self.shared
            .warm
            .upsert_topic(&TopicDoc {
                topic: topic.to_string(),
                tenant: scope.tenant.clone(),
                shards,
                created_at: now,
                updated_at: now,
            })
            .await?;
        Ok(())
    }

    /// Ensure the topic, attach the subscription's consumer group (from the
    /// start of the log), and persist its effective configuration.
    ///
    /// Re-ensuring overwrites the stored configuration with the new values.
    pub async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        config: SubscriptionConfig,
        scope: &Scope,
    ) -> Result<()> {
        self.ensure_topic_with_shards(topic, scope, config.shard_count)
            .await?;

        let log = self.log_key(topic, scope);
        let group = chronow_core::KeySpace::group(subscription);
        match self.shared.hot.group_create(&log, &group, "0").await {
            Ok(()) | Err(StoreError::GroupAlreadyExists { .. }) => {}
            Err(error) => return Err(error.into()),
        }

        let state = SubscriptionState {
            config,
            created_at: now_ms(),
        };
        let key = self
            .shared
            .keys
            .subscription_config(scope, topic, subscription);
        self.shared
            .hot
            .hash_set(&key, CONFIG_FIELD, &serde_json::to_string(&state).map_err(
                chronow_core::CoreError::from,
            )?)
            .await?;
        debug!(topic, subscription, "subscription ensured");
        Ok(())
    }

    /// Load the persisted subscription state, if any.
    pub async fn subscription_state(
        &self,
        topic: &str,
        subscription: &str,
        scope: &Scope,
    ) -> Result<Option<SubscriptionState>> {
        let key = self
            .shared
            .keys
            .subscription_config(scope, topic, subscription);
        let Some(raw) = self.shared.hot.hash_get(&key, CONFIG_FIELD).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|error| ChronowError::Parse {
                what: format!("subscription config for '{topic}/{subscription}'"),
                reason: error.to_string(),
            })
    }

    /// Detach the subscription's group and drop its configuration.
    pub async fn delete_subscription(
        &self,
        topic: &str,
        subscription: &str,
        scope: &Scope,
    ) -> Result<()> {
        let log = self.log_key(topic, scope);
        let group = chronow_core::KeySpace::group(subscription);
        self.shared.hot.group_destroy(&log, &group).await?;

        let key = self
            .shared
            .keys
            .subscription_config(scope, topic, subscription);
        self.shared.hot.kv_del(&[key.as_str()]).await?;
        Ok(())
    }

    /// Drop the topic's log (entries, groups, in-flight state) and re-ensure
    /// an empty topic. Subscriptions must be re-ensured before consuming
    /// again.
    pub async fn purge_topic(&self, topic: &str, scope: &Scope) -> Result<()> {
        let log = self.log_key(topic, scope);
        self.shared.hot.kv_del(&[log.as_str()]).await?;
        self.ensure_topic(topic, scope).await
    }

    pub async fn stats(&self, topic: &str, scope: &Scope) -> Result<TopicStats> {
        let info = self.shared.hot.log_info(&self.log_key(topic, scope)).await?;
        Ok(TopicStats {
            topic: topic.to_string(),
            length: info.length,
            groups: info.groups,
        })
    }

    /// Inspect a subscription's in-flight entries.
    pub async fn pending(
        &self,
        topic: &str,
        subscription: &str,
        scope: &Scope,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let log = self.log_key(topic, scope);
        let group = chronow_core::KeySpace::group(subscription);
        Ok(self.shared.hot.group_pending(&log, &group, count).await?)
    }
}
