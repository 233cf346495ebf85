use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use weft_core::error::WeftError;
use weft_events::bus::DEAD_LETTER_KEY;
use weft_events::{handler_fn, Backoff, EventBus, EventDraft, EventHandler, EventLogEntry, SubscribeOptions};
use weft_test_utils::{test_config, Recorder};

const WAIT: Duration = Duration::from_secs(5);

fn recording(rec: &Recorder<EventLogEntry>) -> Arc<dyn EventHandler> {
    let rec = rec.clone();
    handler_fn(move |event| {
        let rec = rec.clone();
        async move {
            rec.push(event);
            Ok(())
        }
    })
}

fn failing() -> Arc<dyn EventHandler> {
    handler_fn(|_event| async {
        Err(WeftError::Delivery {
            subscriber: "broken".into(),
            message: "boom".into(),
        })
    })
}

async fn open_bus(dir: &std::path::Path) -> Arc<EventBus> {
    EventBus::from_config(&test_config(dir)).await.unwrap()
}

async fn publish(bus: &EventBus, topic: &str, data: serde_json::Value) -> EventLogEntry {
    bus.publish(topic, "created", data, BTreeMap::new(), "test-producer")
        .await
        .unwrap()
}

#[tokio::test]
async fn test_offsets_are_gap_free_per_topic() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;

    publish(&bus, "orders", json!({ "id": 1 })).await;
    publish(&bus, "orders", json!({ "id": 2 })).await;

    let events = bus.get_events(Some("orders"), None, None, None).await.unwrap();
    let offsets: Vec<u64> = events.iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![0, 1]);
    assert_eq!(events[0].partition, events[1].partition);
    assert!(events[0].sequence_number < events[1].sequence_number);
    assert_eq!(events[1].data["id"], 2);
    for e in &events {
        assert!(e.verify_checksum().is_ok());
    }
}

#[tokio::test]
async fn test_latest_offset_tracks_durable_events_only() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    let entry = publish(&bus, "orders", json!({})).await;

    assert_eq!(bus.get_latest_offset(Some(entry.partition)), None);
    assert_eq!(bus.pending_count().await, 1);

    bus.flush().await.unwrap();
    assert_eq!(bus.get_latest_offset(Some(entry.partition)), Some(0));
    assert_eq!(bus.get_latest_offset(None), Some(0));
    assert_eq!(bus.pending_count().await, 0);
}

#[tokio::test]
async fn test_batch_size_forces_inline_flush() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.bus.max_batch_size = 2;
    let bus = EventBus::from_config(&config).await.unwrap();

    let first = publish(&bus, "orders", json!({})).await;
    publish(&bus, "orders", json!({})).await;

    assert_eq!(bus.pending_count().await, 0);
    assert_eq!(bus.get_latest_offset(Some(first.partition)), Some(1));
}

#[tokio::test]
async fn test_publish_batch_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let bus = EventBus::from_config(&config).await.unwrap();

    // A healthy topic in a lower partition than a broken one, so the healthy
    // write lands first and has to be rolled back.
    let topics: Vec<String> = (0..64).map(|i| format!("topic-{}", i)).collect();
    let (good, bad) = topics
        .iter()
        .flat_map(|a| topics.iter().map(move |b| (a, b)))
        .find(|(a, b)| bus.partition_for(a) < bus.partition_for(b))
        .unwrap();

    let bad_dir = bus.log().dir().join(format!("partition-{}", bus.partition_for(bad)));
    std::fs::remove_dir_all(&bad_dir).unwrap();
    std::fs::write(&bad_dir, b"not a directory").unwrap();

    let result = bus
        .publish_batch(
            vec![
                EventDraft::new(good.as_str(), "created", json!({ "n": 1 })),
                EventDraft::new(bad.as_str(), "created", json!({ "n": 2 })),
            ],
            "test-producer",
        )
        .await;
    assert!(result.is_err());

    assert!(bus.get_events(Some(good.as_str()), None, None, None).await.unwrap().is_empty());
    assert_eq!(bus.get_latest_offset(Some(bus.partition_for(good))), None);

    // Positions were not consumed by the failed commit.
    let next = publish(&bus, good, json!({})).await;
    assert_eq!(next.offset, 0);
    assert_eq!(next.sequence_number, 0);
}

#[tokio::test]
async fn test_publish_batch_notifies_after_commit() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    let rec = Recorder::new();
    bus.subscribe("s", "orders.*", recording(&rec), SubscribeOptions::new())
        .await
        .unwrap();

    let committed = bus
        .publish_batch(
            vec![
                EventDraft::new("orders.created", "created", json!({ "n": 1 })),
                EventDraft::new("orders.paid", "paid", json!({ "n": 2 })),
                EventDraft::new("billing.charged", "charged", json!({ "n": 3 })),
            ],
            "checkout",
        )
        .await
        .unwrap();
    assert_eq!(committed.len(), 3);
    assert!(committed.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
    assert!(committed.iter().all(|e| e.producer_id == "checkout"));

    let seen = rec.wait_for(2, WAIT).await;
    let topics: Vec<&str> = seen.iter().map(|e| e.topic.as_str()).collect();
    assert_eq!(topics, vec!["orders.created", "orders.paid"]);
}

#[tokio::test]
async fn test_aborted_and_expired_transactions_reject_work() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;

    let tx = bus.begin_transaction("p", None).unwrap();
    bus.add_to_transaction(&tx, EventDraft::new("orders", "created", json!({})))
        .unwrap();
    bus.abort_transaction(&tx).unwrap();
    assert!(matches!(
        bus.commit_transaction(&tx).await,
        Err(WeftError::TransactionNotActive { .. })
    ));

    let tx = bus
        .begin_transaction("p", Some(Duration::from_millis(20)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let result = bus.add_to_transaction(&tx, EventDraft::new("orders", "created", json!({})));
    assert!(matches!(
        result,
        Err(WeftError::TransactionTimeout(_)) | Err(WeftError::TransactionNotActive { .. })
    ));

    assert!(matches!(
        bus.commit_transaction("missing").await,
        Err(WeftError::TransactionNotFound(_))
    ));
    assert!(bus.get_events(None, None, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_then_live_delivers_each_event_once_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    for i in 0..3 {
        publish(&bus, "orders", json!({ "i": i })).await;
    }

    let rec = Recorder::new();
    bus.subscribe("replayer", "orders", recording(&rec), SubscribeOptions::new().from_offset(0))
        .await
        .unwrap();
    // Replay completes before subscribe returns.
    assert_eq!(rec.len(), 3);

    for i in 3..5 {
        publish(&bus, "orders", json!({ "i": i })).await;
    }
    bus.flush().await.unwrap();

    rec.wait_for(5, WAIT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let offsets: Vec<u64> = rec.items().iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_replay_respects_offset_range() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    for i in 0..5 {
        publish(&bus, "orders", json!({ "i": i })).await;
    }

    let rec = Recorder::new();
    bus.subscribe(
        "ranged",
        "orders",
        recording(&rec),
        SubscribeOptions::new().from_offset(1).until_offset(3),
    )
    .await
    .unwrap();

    let offsets: Vec<u64> = rec.items().iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_wildcard_and_filter_select_events() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    let rec = Recorder::new();
    bus.subscribe(
        "big-orders",
        "orders.*",
        recording(&rec),
        SubscribeOptions::new().filter(|e| e.data["amount"].as_i64().unwrap_or(0) >= 100),
    )
    .await
    .unwrap();

    publish(&bus, "orders.created", json!({ "amount": 10 })).await;
    publish(&bus, "billing.created", json!({ "amount": 500 })).await;
    publish(&bus, "orders.created", json!({ "amount": 150 })).await;
    bus.flush().await.unwrap();

    let seen = rec.wait_for(1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rec.len(), 1);
    assert_eq!(seen[0].data["amount"], 150);
}

#[tokio::test]
async fn test_failing_subscriber_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    let rec = Recorder::new();

    let broken = bus
        .subscribe("broken", "orders", failing(), SubscribeOptions::new())
        .await
        .unwrap();
    bus.subscribe("healthy", "orders", recording(&rec), SubscribeOptions::new())
        .await
        .unwrap();

    publish(&bus, "orders", json!({})).await;
    bus.flush().await.unwrap();

    rec.wait_for(1, WAIT).await;
    let stats = bus.subscription_stats(&broken).unwrap();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.failed_attempts, 1);
}

#[tokio::test]
async fn test_retries_then_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    bus.start();

    let dlq = Recorder::new();
    bus.subscribe("dlq-watcher", "orders.dlq", recording(&dlq), SubscribeOptions::new())
        .await
        .unwrap();
    let broken = bus
        .subscribe(
            "broken",
            "orders",
            failing(),
            SubscribeOptions::new()
                .retries(2, Duration::from_millis(5), Backoff::Linear)
                .dead_letter("orders.dlq"),
        )
        .await
        .unwrap();

    let original = publish(&bus, "orders", json!({ "id": 7 })).await;

    let letters = dlq.wait_for(1, WAIT).await;
    let letter = &letters[0];
    assert_eq!(letter.event_type, "dead_letter");
    assert_eq!(letter.metadata.get(DEAD_LETTER_KEY).map(String::as_str), Some("true"));
    assert_eq!(letter.data["originalEvent"]["id"], original.id);
    assert_eq!(letter.data["subscriberId"], "broken");
    assert_eq!(letter.data["attempts"], 3);
    assert_eq!(letter.data["error"].as_str().map(|s| s.contains("boom")), Some(true));

    let stats = bus.subscription_stats(&broken).unwrap();
    assert_eq!(stats.failed_attempts, 3);
    assert_eq!(stats.dead_lettered, 1);

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let bus = open_bus(dir.path()).await;
    let rec = Recorder::new();
    let id = bus
        .subscribe("s", "orders", recording(&rec), SubscribeOptions::new())
        .await
        .unwrap();

    assert!(bus.unsubscribe(&id));
    assert!(!bus.unsubscribe(&id));
    assert_eq!(bus.subscription_count(), 0);

    publish(&bus, "orders", json!({})).await;
    bus.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rec.is_empty());
}

#[tokio::test]
async fn test_reopen_continues_positions() {
    let dir = tempfile::tempdir().unwrap();
    {
        let bus = open_bus(dir.path()).await;
        publish(&bus, "orders", json!({})).await;
        publish(&bus, "billing", json!({})).await;
        publish(&bus, "orders", json!({})).await;
        bus.shutdown().await.unwrap();
        assert!(matches!(
            bus.publish("orders", "x", json!({}), BTreeMap::new(), "p").await,
            Err(WeftError::BusClosed)
        ));
    }

    let bus = open_bus(dir.path()).await;
    let shared = bus.partition_for("orders") == bus.partition_for("billing");
    let next = publish(&bus, "orders", json!({})).await;
    assert_eq!(next.offset, if shared { 3 } else { 2 });
    assert_eq!(next.sequence_number, 3);

    let index = bus.log().index();
    let stats = index.get("orders", next.partition).unwrap();
    assert_eq!(stats.event_count, 2);
}

#[tokio::test]
async fn test_tampered_entry_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.log.verify_checksums = true;
    let bus = EventBus::from_config(&config).await.unwrap();

    let entry = publish(&bus, "orders", json!({ "amount": 10 })).await;
    bus.flush().await.unwrap();

    let segment = bus
        .log()
        .dir()
        .join(format!("partition-{}", entry.partition))
        .join("events-000000.log");
    let raw = std::fs::read_to_string(&segment).unwrap();
    std::fs::write(&segment, raw.replace("\"amount\":10", "\"amount\":99")).unwrap();

    let result = bus.get_events(Some("orders"), None, None, None).await;
    assert!(matches!(result, Err(WeftError::Integrity { .. })));
}
