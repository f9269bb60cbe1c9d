//! Integration tests for the real-time feed client
//!
//! These tests run the feed against an in-memory push server:
//! - Lazy connection and subscription messages
//! - Sequence ordering and duplicate suppression
//! - Reconnect with re-subscription
//! - Deferral of remote changes behind pending local operations
//! - Schema change notifications

use bridge_desktop::MemoryLocalStore;
use bridge_traits::{Clock, RetryPolicy, SystemClock};
use chrono::Utc;
use core_auth::{CredentialManager, StaticCredentialSource};
use core_runtime::events::{ChangeSource, CoreEvent, EventBus, FeedEvent, RecordEvent};
use core_sync::testing::{delete_message, record_message, FakePushConnector, FakeRecordApi};
use core_sync::{FeedConfig, MutationQueue, QueueConfig, RealtimeFeed, SyncState, SyncStore};
use provider_records::{Record, TableRef};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    push: FakePushConnector,
    feed: RealtimeFeed,
    state: Arc<SyncState>,
    events: Receiver<CoreEvent>,
}

async fn harness() -> Harness {
    let bus = EventBus::new(256);
    let events = bus.subscribe();
    let state = SyncState::restore(
        SyncStore::new(Arc::new(MemoryLocalStore::new()), "test"),
        bus.clone(),
    )
    .await
    .unwrap();
    let credentials = CredentialManager::new(
        Arc::new(StaticCredentialSource::new("token")),
        bus.clone(),
    );
    let push = FakePushConnector::new();
    let feed = RealtimeFeed::new(
        Arc::new(push.clone()),
        credentials,
        state.clone(),
        FeedConfig {
            url: "wss://api.test/v0/feed".to_string(),
            retry_policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                use_exponential_backoff: true,
                jitter_ratio: 0.0,
            },
        },
        CancellationToken::new(),
    );
    Harness {
        push,
        feed,
        state,
        events,
    }
}

fn tasks() -> TableRef {
    TableRef::new("app1", "tasks")
}

fn record(id: &str, name: &str, version: i64) -> Record {
    let mut record = Record::new(
        id,
        json!({ "Name": name }).as_object().cloned().unwrap(),
        Utc::now(),
    );
    record.version = Some(version);
    record
}

/// Wait for the first event matching `predicate`.
async fn next_matching<F>(events: &mut Receiver<CoreEvent>, predicate: F) -> CoreEvent
where
    F: Fn(&CoreEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

async fn eventually<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connects_lazily_and_subscribes() {
    let mut h = harness().await;
    let table = tasks();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.push.connect_count(), 0);

    h.feed.subscribe(&table).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(1)).await.unwrap();

    assert_eq!(h.push.connect_count(), 1);
    assert_eq!(
        h.push.sent_json(),
        vec![json!({"type": "subscribe", "baseId": "app1", "tableId": "tasks"})]
    );
    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Feed(FeedEvent::Connected { subscriptions: 1 }))
    })
    .await;
    assert!(h.feed.is_connected());
}

#[tokio::test]
async fn test_subscribe_is_idempotent_and_unsubscribe_sends_message() {
    let h = harness().await;
    let table = tasks();

    h.feed.subscribe(&table).await.unwrap();
    h.feed.subscribe(&table).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(1)).await.unwrap();
    assert_eq!(h.feed.subscriptions().await, vec![table.clone()]);

    h.feed.unsubscribe(&table).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(2)).await.unwrap();

    let sent = h.push.sent_json();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1]["type"], json!("unsubscribe"));
    assert!(h.feed.subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_applies_events_in_sequence_and_drops_duplicates() {
    let mut h = harness().await;
    let table = tasks();
    h.feed.subscribe(&table).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(1)).await.unwrap();

    assert!(h
        .push
        .push_json(&record_message("record.created", &table, &record("rec1", "first", 1), 1)));
    next_matching(&mut h.events, |e| {
        matches!(
            e,
            CoreEvent::Record(RecordEvent::Created {
                source: ChangeSource::Remote,
                ..
            })
        )
    })
    .await;

    // Replayed sequence number
    h.push
        .push_json(&record_message("record.updated", &table, &record("rec1", "dup", 2), 1));
    h.push
        .push_json(&record_message("record.updated", &table, &record("rec1", "second", 3), 2));
    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Record(RecordEvent::Updated { .. }))
    })
    .await;

    let guard = h.state.lock().await;
    assert_eq!(guard.record(&table, "rec1").unwrap().fields["Name"], json!("second"));
    assert_eq!(guard.last_sequence(&table), Some(2));
    drop(guard);

    h.push.push_json(&delete_message(&table, "rec1", 3));
    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Record(RecordEvent::Deleted { .. }))
    })
    .await;
    assert!(h.state.lock().await.record(&table, "rec1").is_none());
}

#[tokio::test]
async fn test_ignores_unsubscribed_tables_and_malformed_messages() {
    let mut h = harness().await;
    let table = tasks();
    let other = TableRef::new("app1", "other");
    h.feed.subscribe(&table).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(1)).await.unwrap();

    h.push.push("not json");
    h.push
        .push_json(&record_message("record.created", &other, &record("recX", "x", 1), 1));
    h.push
        .push_json(&record_message("record.created", &table, &record("rec1", "y", 1), 1));

    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Record(RecordEvent::Created { .. }))
    })
    .await;
    assert!(h.state.lock().await.record(&other, "recX").is_none());
    assert!(h.state.lock().await.record(&table, "rec1").is_some());
}

#[tokio::test]
async fn test_reconnects_and_resubscribes() {
    let mut h = harness().await;
    let first = tasks();
    let second = TableRef::new("app1", "projects");
    h.feed.subscribe(&first).await.unwrap();
    h.feed.subscribe(&second).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(2)).await.unwrap();

    h.push.fail_next_connects(1);
    h.push.drop_connection();

    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Feed(FeedEvent::Disconnected { .. }))
    })
    .await;
    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Feed(FeedEvent::Reconnecting { attempt: 1, .. }))
    })
    .await;
    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Feed(FeedEvent::Reconnecting { attempt: 2, .. }))
    })
    .await;
    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Feed(FeedEvent::Connected { subscriptions: 2 }))
    })
    .await;

    assert_eq!(h.push.connect_count(), 2);
    let resubscribed: Vec<_> = h.push.sent_json().into_iter().skip(2).collect();
    assert_eq!(resubscribed.len(), 2);
    assert!(resubscribed.iter().all(|m| m["type"] == json!("subscribe")));
}

#[tokio::test]
async fn test_remote_change_waits_for_pending_local_operation() {
    let h = harness().await;
    let table = tasks();

    h.state
        .lock()
        .await
        .put_record(&table, record("rec1", "original", 1))
        .await
        .unwrap();

    let api = FakeRecordApi::new();
    api.insert(&table, record("rec1", "remote", 2));
    api.set_offline(true);
    let queue = MutationQueue::new(
        h.state.clone(),
        Arc::new(api.clone()),
        QueueConfig::default(),
        Arc::new(SystemClock) as Arc<dyn Clock>,
        CancellationToken::new(),
    );
    queue
        .update(
            &table,
            "rec1",
            json!({"Name": "local"}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();

    h.feed.subscribe(&table).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(1)).await.unwrap();
    h.push
        .push_json(&record_message("record.updated", &table, &record("rec1", "remote", 2), 1));

    let state = h.state.clone();
    let probe = table.clone();
    eventually(|| {
        let state = state.clone();
        let probe = probe.clone();
        async move { state.lock().await.deferred_len(&probe) == 1 }
    })
    .await;
    assert_eq!(
        h.state.lock().await.record(&table, "rec1").unwrap().fields["Name"],
        json!("local")
    );

    api.set_offline(false);
    let result = queue.drain_all().await.unwrap();
    assert_eq!(result.applied.len(), 1);

    // The deferred change predates the confirmed write
    let guard = h.state.lock().await;
    assert_eq!(guard.deferred_len(&table), 0);
    let cached = guard.record(&table, "rec1").unwrap();
    assert_eq!(cached.fields["Name"], json!("local"));
    assert_eq!(cached.version, Some(3));
}

#[tokio::test]
async fn test_schema_change_marks_table_stale() {
    let mut h = harness().await;
    let table = tasks();
    h.feed.subscribe(&table).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(1)).await.unwrap();

    h.push.push_json(&json!({
        "type": "table.updated",
        "tableRef": {"baseId": "app1", "tableId": "tasks"},
        "payload": {},
        "sequence": 1,
    }));

    let event = next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Feed(FeedEvent::SchemaChanged { .. }))
    })
    .await;
    assert_eq!(
        event,
        CoreEvent::Feed(FeedEvent::SchemaChanged {
            base_id: "app1".to_string(),
            table_id: Some("tasks".to_string()),
        })
    );
    assert!(h.state.snapshot(&table).await.unwrap().stale);
}

#[tokio::test]
async fn test_shutdown_stops_reconnecting() {
    let mut h = harness().await;
    h.feed.subscribe(&tasks()).await.unwrap();
    timeout(WAIT, h.push.wait_for_sent(1)).await.unwrap();

    h.feed.shutdown();
    next_matching(&mut h.events, |e| {
        matches!(e, CoreEvent::Feed(FeedEvent::Disconnected { .. }))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.push.connect_count(), 1);
    assert!(!h.feed.is_connected());
    assert!(h.feed.subscribe(&TableRef::new("app1", "late")).await.is_err());
}

#[tokio::test]
async fn test_rejects_invalid_table() {
    let h = harness().await;
    let result = h.feed.subscribe(&TableRef::new("", "tasks")).await;
    assert!(result.is_err());
    assert_eq!(h.push.connect_count(), 0);
}
