//! Backend contract suite.
//!
//! Every `HotStore` implementation must satisfy the same observable
//! semantics; each check below runs against both the native in-process
//! engine and the portable document emulation.

use bytes::Bytes;
use chronow_store::{HotStore, MemoryHotStore, SqliteHotStore, StoreError, RANGE_MAX, RANGE_MIN};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn both_backends() -> Vec<(&'static str, Arc<dyn HotStore>)> {
    vec![
        ("memory", Arc::new(MemoryHotStore::new()) as Arc<dyn HotStore>),
        (
            "sqlite",
            Arc::new(SqliteHotStore::connect_in_memory().await.unwrap()) as Arc<dyn HotStore>,
        ),
    ]
}

fn parse_id(id: &str) -> (i64, u64) {
    let (ms, seq) = id.split_once('-').expect("entry id shape");
    (ms.parse().unwrap(), seq.parse().unwrap())
}

#[tokio::test]
async fn ids_increase_and_len_tracks_appends() {
    for (name, store) in both_backends().await {
        let mut last = (i64::MIN, 0);
        for n in 0..10 {
            let id = store
                .log_append("log", &fields(&[("n", &n.to_string())]), 1_000)
                .await
                .unwrap();
            let parsed = parse_id(&id);
            assert!(parsed > last, "backend {name}: id order");
            last = parsed;
        }
        assert_eq!(store.log_len("log").await.unwrap(), 10, "backend {name}");
    }
}

#[tokio::test]
async fn delivery_is_exclusive_within_a_group() {
    for (name, store) in both_backends().await {
        store.group_create("log", "g", "0").await.unwrap();
        for n in 0..4 {
            store
                .log_append("log", &fields(&[("n", &n.to_string())]), 1_000)
                .await
                .unwrap();
        }

        let a = store.group_read("log", "g", "c1", 0, 2).await.unwrap();
        let b = store.group_read("log", "g", "c2", 0, 10).await.unwrap();
        assert_eq!(a.len(), 2, "backend {name}");
        assert_eq!(b.len(), 2, "backend {name}");

        let mut ids: Vec<&str> = a.iter().chain(b.iter()).map(|e| e.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4, "backend {name}: no id delivered twice");

        // Each in-flight entry has exactly one holder.
        let pending = store.group_pending("log", "g", 10).await.unwrap();
        assert_eq!(pending.len(), 4, "backend {name}");
    }
}

#[tokio::test]
async fn ack_is_terminal_for_the_group() {
    for (name, store) in both_backends().await {
        store.group_create("log", "g", "0").await.unwrap();
        store.log_append("log", &fields(&[("n", "1")]), 1_000).await.unwrap();

        let read = store.group_read("log", "g", "c1", 0, 10).await.unwrap();
        assert_eq!(store.group_ack("log", "g", &[read[0].id.as_str()]).await.unwrap(), 1);

        assert!(
            store.group_read("log", "g", "c2", 0, 10).await.unwrap().is_empty(),
            "backend {name}: acked entry redelivered as new"
        );
        assert!(
            store.group_reclaim("log", "g", "c2", 0, 10).await.unwrap().is_empty(),
            "backend {name}: acked entry reclaimable"
        );
    }
}

#[tokio::test]
async fn reclaim_hands_idle_entries_to_the_caller() {
    for (name, store) in both_backends().await {
        store.group_create("log", "g", "0").await.unwrap();
        store.log_append("log", &fields(&[("n", "1")]), 1_000).await.unwrap();
        let read = store.group_read("log", "g", "c1", 0, 10).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let reclaimed = store.group_reclaim("log", "g", "c2", 40, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1, "backend {name}");
        assert_eq!(reclaimed[0].id, read[0].id);
        assert_eq!(reclaimed[0].fields["n"], "1");

        let pending = store.group_pending("log", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c2", "backend {name}");
        assert!(pending[0].deliveries >= 2, "backend {name}");
    }
}

#[tokio::test]
async fn duplicate_group_creation_is_distinct() {
    for (name, store) in both_backends().await {
        store.group_create("log", "g", "0").await.unwrap();
        assert!(
            matches!(
                store.group_create("log", "g", "0").await,
                Err(StoreError::GroupAlreadyExists { .. })
            ),
            "backend {name}"
        );
        // Destroy then recreate round-trips.
        store.group_destroy("log", "g").await.unwrap();
        store.group_create("log", "g", "0").await.unwrap();
    }
}

#[tokio::test]
async fn groups_created_before_appends_see_history_from_start() {
    for (name, store) in both_backends().await {
        // The create/destroy pair topic creation relies on.
        store.group_create("log", "init", "0").await.unwrap();
        store.group_destroy("log", "init").await.unwrap();

        store.log_append("log", &fields(&[("n", "1")]), 1_000).await.unwrap();
        store.group_create("log", "g", "0").await.unwrap();

        let read = store.group_read("log", "g", "c1", 0, 10).await.unwrap();
        assert_eq!(read.len(), 1, "backend {name}: start-id 0 sees history");
    }
}

#[tokio::test]
async fn soft_trim_drops_oldest_entries() {
    for (name, store) in both_backends().await {
        for n in 0..8 {
            store
                .log_append("log", &fields(&[("n", &n.to_string())]), 5)
                .await
                .unwrap();
        }
        assert_eq!(store.log_len("log").await.unwrap(), 5, "backend {name}");
        let range = store.log_range("log", RANGE_MIN, RANGE_MAX, 100).await.unwrap();
        assert_eq!(range.first().unwrap().fields["n"], "3", "backend {name}");
        assert_eq!(range.last().unwrap().fields["n"], "7", "backend {name}");
    }
}

#[tokio::test]
async fn zset_ranges_ascend_by_score() {
    for (name, store) in both_backends().await {
        store.zset_add("z", 300, "late").await.unwrap();
        store.zset_add("z", 100, "early").await.unwrap();
        store.zset_add("z", 200, "middle").await.unwrap();

        let due = store.zset_range_by_score("z", i64::MIN, 250, 10).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "middle".to_string()], "backend {name}");

        // Re-scoring moves, not duplicates, the member.
        store.zset_add("z", 50, "late").await.unwrap();
        assert_eq!(store.zset_card("z").await.unwrap(), 3, "backend {name}");
        let due = store.zset_range_by_score("z", i64::MIN, 60, 10).await.unwrap();
        assert_eq!(due, vec!["late".to_string()], "backend {name}");

        assert_eq!(store.zset_remove("z", &["late", "missing"]).await.unwrap(), 1);
    }
}

#[tokio::test]
async fn kv_ttl_and_exists() {
    for (name, store) in both_backends().await {
        store.kv_set("keep", Bytes::from_static(b"1"), None).await.unwrap();
        store.kv_set("fade", Bytes::from_static(b"2"), Some(1)).await.unwrap();
        assert_eq!(store.kv_exists(&["keep", "fade", "nope"]).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(store.kv_get("fade").await.unwrap().is_none(), "backend {name}");
        assert_eq!(store.kv_exists(&["keep", "fade"]).await.unwrap(), 1);

        assert!(store.kv_expire("keep", 1).await.unwrap());
        assert!(!store.kv_expire("fade", 1).await.unwrap(), "backend {name}");
    }
}

#[tokio::test]
async fn hash_fields_round_trip() {
    for (name, store) in both_backends().await {
        store.hash_set("h", "config", "{\"max\":3}").await.unwrap();
        store.hash_set("h", "other", "x").await.unwrap();
        assert_eq!(
            store.hash_get("h", "config").await.unwrap().as_deref(),
            Some("{\"max\":3}"),
            "backend {name}"
        );
        store.hash_set("h", "config", "{\"max\":5}").await.unwrap();
        assert_eq!(
            store.hash_get("h", "config").await.unwrap().as_deref(),
            Some("{\"max\":5}"),
            "backend {name}"
        );
    }
}

#[tokio::test]
async fn deleting_a_log_key_resets_it() {
    for (name, store) in both_backends().await {
        store.group_create("log", "g", "0").await.unwrap();
        for n in 0..3 {
            store
                .log_append("log", &fields(&[("n", &n.to_string())]), 100)
                .await
                .unwrap();
        }
        assert_eq!(store.kv_del(&["log"]).await.unwrap(), 1, "backend {name}");
        assert_eq!(store.log_len("log").await.unwrap(), 0, "backend {name}");

        // The log remains usable afterwards.
        store.group_create("log", "g", "0").await.unwrap();
        store.log_append("log", &fields(&[("n", "again")]), 100).await.unwrap();
        let read = store.group_read("log", "g", "c1", 0, 10).await.unwrap();
        assert_eq!(read.len(), 1, "backend {name}");
    }
}

#[tokio::test]
async fn portable_backend_state_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("hot.db").display());

    {
        let store = SqliteHotStore::connect(&url).await.unwrap();
        store.group_create("log", "g", "0").await.unwrap();
        store.log_append("log", &fields(&[("n", "1")]), 100).await.unwrap();
        store.group_read("log", "g", "c1", 0, 10).await.unwrap();
        store.close().await.unwrap();
    }

    // A new connection sees the log, the group, and the in-flight entry -
    // which a later consumer can reclaim.
    let store = SqliteHotStore::connect(&url).await.unwrap();
    assert_eq!(store.log_len("log").await.unwrap(), 1);
    let pending = store.group_pending("log", "g", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "c1");

    tokio::time::sleep(Duration::from_millis(30)).await;
    let reclaimed = store.group_reclaim("log", "g", "c2", 20, 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    store.close().await.unwrap();
}

#[tokio::test]
async fn scoped_keys_do_not_interfere() {
    for (name, store) in both_backends().await {
        let t1 = "cw:t1:ns1:topic:orders";
        let t2 = "cw:t2:ns2:topic:orders";
        store.group_create(t1, "sub:s", "0").await.unwrap();
        store.group_create(t2, "sub:s", "0").await.unwrap();
        store.log_append(t1, &fields(&[("n", "1")]), 100).await.unwrap();

        assert_eq!(store.log_len(t1).await.unwrap(), 1, "backend {name}");
        assert_eq!(store.log_len(t2).await.unwrap(), 0, "backend {name}");
        assert!(store.group_read(t2, "sub:s", "c", 0, 10).await.unwrap().is_empty());
    }
}
