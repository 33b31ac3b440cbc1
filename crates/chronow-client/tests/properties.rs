//! Property-style checks: at-least-once delivery, bounded deliveries,
//! tenant/namespace isolation, purge semantics, and KV round-trips.

use chronow_client::{Chronow, NackOptions, PublishOptions, SetOptions, SubscribeOptions};
use chronow_core::{ChronowConfig, Scope, SubscriptionConfig};
use serde_json::json;
use std::collections::HashSet;
use std::time::{Duration, Instant};

fn subscription(visibility_ms: u64, max_deliveries: u32) -> SubscriptionConfig {
    SubscriptionConfig {
        visibility_timeout_ms: visibility_ms,
        max_deliveries,
        retry_backoff_ms: vec![50, 100, 200],
        dead_letter_enabled: true,
        shard_count: 1,
        block_ms: 50,
        count_per_read: 10,
    }
}

#[tokio::test]
async fn every_published_message_is_delivered_at_least_once() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let scope = Scope::default();
    broker
        .topics()
        .ensure_subscription("events", "all", subscription(300, 5), &scope)
        .await
        .unwrap();

    let total = 12u32;
    for n in 0..total {
        broker
            .producer()
            .publish("events", &json!({"n": n}), PublishOptions::default())
            .await
            .unwrap();
    }

    let subscriber = broker
        .subscribe("events", "all", SubscribeOptions::default())
        .await
        .unwrap();

    // First delivery of every odd message is nacked without requeue (stays
    // in flight until the visibility timeout); the rest are acked. Every
    // message must still be seen and acked eventually.
    let mut acked: HashSet<u64> = HashSet::new();
    let mut nacked_once: HashSet<u64> = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while acked.len() < total as usize && Instant::now() < deadline {
        for message in subscriber.poll().await.unwrap() {
            let n = message.payload["n"].as_u64().unwrap();
            if n % 2 == 1 && nacked_once.insert(n) {
                message.nack(NackOptions::default()).await.unwrap();
            } else {
                message.ack().await.unwrap();
                acked.insert(n);
            }
        }
    }

    assert_eq!(acked.len(), total as usize, "missing deliveries: {acked:?}");
    assert_eq!(
        broker.dead_letters().length("events", &scope).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn deliveries_are_bounded_by_the_subscription_budget() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let scope = Scope::default();
    broker
        .topics()
        .ensure_subscription("events", "bounded", subscription(1_000, 2), &scope)
        .await
        .unwrap();

    broker
        .producer()
        .publish("events", &json!({"id": "x"}), PublishOptions::default())
        .await
        .unwrap();

    let subscriber = broker
        .subscribe("events", "bounded", SubscribeOptions::default())
        .await
        .unwrap();

    let mut deliveries = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        for message in subscriber.poll().await.unwrap() {
            deliveries += 1;
            message
                .nack(NackOptions {
                    requeue: true,
                    delay_ms: None,
                })
                .await
                .unwrap();
        }
        if broker.dead_letters().length("events", &scope).await.unwrap() > 0 {
            break;
        }
    }

    assert_eq!(deliveries, 2, "budget of 2 deliveries was not honored");
    assert_eq!(broker.dead_letters().length("events", &scope).await.unwrap(), 1);
    // Nothing further arrives once dead-lettered.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(subscriber.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_delays_follow_the_ladder() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let scope = Scope::default();
    broker
        .topics()
        .ensure_subscription(
            "events",
            "ladder",
            SubscriptionConfig {
                visibility_timeout_ms: 5_000,
                max_deliveries: 5,
                retry_backoff_ms: vec![100, 300],
                dead_letter_enabled: true,
                shard_count: 1,
                block_ms: 30,
                count_per_read: 10,
            },
            &scope,
        )
        .await
        .unwrap();
    broker
        .producer()
        .publish("events", &json!({"id": "r"}), PublishOptions::default())
        .await
        .unwrap();

    let subscriber = broker
        .subscribe("events", "ladder", SubscribeOptions::default())
        .await
        .unwrap();

    let mut arrivals = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(6);
    while arrivals.len() < 3 && Instant::now() < deadline {
        for message in subscriber.poll().await.unwrap() {
            arrivals.push(Instant::now());
            if arrivals.len() < 3 {
                message
                    .nack(NackOptions {
                        requeue: true,
                        delay_ms: None,
                    })
                    .await
                    .unwrap();
            } else {
                message.ack().await.unwrap();
            }
        }
    }
    assert_eq!(arrivals.len(), 3);

    // Attempt 1 waits ~100ms (plus ≤20% jitter and loop latency), attempt 2
    // waits ~300ms. Lower bounds are firm; upper bounds allow scheduling
    // slack.
    let first_gap = arrivals[1] - arrivals[0];
    let second_gap = arrivals[2] - arrivals[1];
    assert!(first_gap >= Duration::from_millis(95), "first gap {first_gap:?}");
    assert!(first_gap < Duration::from_millis(1_000), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(290), "second gap {second_gap:?}");
    assert!(second_gap < Duration::from_millis(1_500), "second gap {second_gap:?}");
}

#[tokio::test]
async fn scopes_are_isolated() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let tenant_one = Scope::new("t1", "ns1");
    let tenant_two = Scope::new("t2", "ns2");

    broker
        .topics()
        .ensure_subscription("orders", "s", subscription(1_000, 3), &tenant_one)
        .await
        .unwrap();
    broker
        .topics()
        .ensure_subscription("orders", "s", subscription(1_000, 3), &tenant_two)
        .await
        .unwrap();

    broker
        .producer()
        .publish(
            "orders",
            &json!({"tenant": "one"}),
            PublishOptions {
                scope: tenant_one.clone(),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(broker.topics().stats("orders", &tenant_one).await.unwrap().length, 1);
    assert_eq!(broker.topics().stats("orders", &tenant_two).await.unwrap().length, 0);

    let other = broker
        .subscribe(
            "orders",
            "s",
            SubscribeOptions {
                scope: tenant_two.clone(),
                ..SubscribeOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(other.poll().await.unwrap().is_empty());

    // Shared-memory values are scoped the same way.
    broker
        .shared_memory()
        .set(
            "flag",
            &json!(true),
            SetOptions {
                scope: tenant_one.clone(),
                ..SetOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        broker.shared_memory().get("flag", &tenant_two).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn purge_resets_a_topic_but_keeps_it_usable() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let scope = Scope::default();
    broker
        .topics()
        .ensure_subscription("orders", "s", subscription(1_000, 3), &scope)
        .await
        .unwrap();

    for n in 0..3 {
        broker
            .producer()
            .publish("orders", &json!({"n": n}), PublishOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(broker.topics().stats("orders", &scope).await.unwrap().length, 3);

    broker.topics().purge_topic("orders", &scope).await.unwrap();
    assert_eq!(broker.topics().stats("orders", &scope).await.unwrap().length, 0);

    broker
        .producer()
        .publish("orders", &json!({"n": "after"}), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.topics().stats("orders", &scope).await.unwrap().length, 1);
}

#[tokio::test]
async fn kv_round_trips_and_expires_without_warm_persistence() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let scope = Scope::default();

    let value = json!({"nested": {"list": [1, 2, 3], "text": "v"}});
    broker
        .shared_memory()
        .set(
            "cfg",
            &value,
            SetOptions {
                hot_ttl_sec: Some(1),
                ..SetOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        broker.shared_memory().get("cfg", &scope).await.unwrap(),
        Some(value)
    );

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(broker.shared_memory().get("cfg", &scope).await.unwrap(), None);
}

#[tokio::test]
async fn dead_lettering_disabled_drops_exhausted_messages() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let scope = Scope::default();
    broker
        .topics()
        .ensure_subscription(
            "events",
            "no-dlq",
            SubscriptionConfig {
                dead_letter_enabled: false,
                ..subscription(1_000, 2)
            },
            &scope,
        )
        .await
        .unwrap();
    broker
        .producer()
        .publish("events", &json!({"id": "x"}), PublishOptions::default())
        .await
        .unwrap();

    let subscriber = broker
        .subscribe("events", "no-dlq", SubscribeOptions::default())
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut deliveries = 0;
    while deliveries < 2 && Instant::now() < deadline {
        for message in subscriber.poll().await.unwrap() {
            deliveries += 1;
            message
                .nack(NackOptions {
                    requeue: true,
                    delay_ms: None,
                })
                .await
                .unwrap();
        }
    }

    // The message is gone without a dead-letter record.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(subscriber.poll().await.unwrap().is_empty());
    assert_eq!(broker.dead_letters().length("events", &scope).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_subscription_detaches_consumers() {
    let broker = Chronow::connect(ChronowConfig::default()).await.unwrap();
    let scope = Scope::default();
    broker
        .topics()
        .ensure_subscription("orders", "temp", subscription(1_000, 3), &scope)
        .await
        .unwrap();
    assert!(broker
        .topics()
        .subscription_state("orders", "temp", &scope)
        .await
        .unwrap()
        .is_some());

    broker
        .topics()
        .delete_subscription("orders", "temp", &scope)
        .await
        .unwrap();
    assert!(broker
        .topics()
        .subscription_state("orders", "temp", &scope)
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        broker.subscribe("orders", "temp", SubscribeOptions::default()).await,
        Err(chronow_client::ChronowError::SubscriptionNotFound { .. })
    ));
}
