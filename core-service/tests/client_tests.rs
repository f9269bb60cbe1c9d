//! Integration tests for the sync client façade
//!
//! These tests wire the client to an in-memory record server and push feed:
//! - Offline create, reconnect and sync
//! - Cached reads while offline
//! - Backpressure and pass-through writes without the offline queue
//! - Attachments, formulas, subscriptions and lifecycle

use async_trait::async_trait;
use bridge_desktop::MemoryLocalStore;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, MultipartFile, ProgressCallback,
};
use bridge_traits::LocalStore;
use core_auth::{CredentialManager, StaticCredentialSource};
use core_runtime::config::SyncClientConfigBuilder;
use core_runtime::events::{ConnectionEvent, CoreEvent, EventBus, FeedEvent};
use core_service::{
    ClientError, ListQuery, ReadOptions, SortSpec, SyncClient, SyncClientConfig,
    SyncDependencies, TableRef,
};
use core_sync::testing::{FakePushConnector, FakeRecordApi};
use mockall::mock;
use provider_records::{ApiError, ConnectionMonitor, Fields, Record};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

mock! {
    HttpClient {}

    #[async_trait]
    impl HttpClient for HttpClient {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
        async fn upload_multipart(
            &self,
            request: HttpRequest,
            file: MultipartFile,
            progress: Option<ProgressCallback>,
        ) -> BridgeResult<HttpResponse>;
    }
}

struct Harness {
    client: SyncClient,
    api: FakeRecordApi,
    push: FakePushConnector,
    events: Receiver<CoreEvent>,
}

fn base_config(store: Arc<dyn LocalStore>, push: &FakePushConnector) -> SyncClientConfigBuilder {
    SyncClientConfig::builder()
        .credential_source(Arc::new(StaticCredentialSource::new("token")))
        .base_url("https://api.test")
        .http_client(Arc::new(MockHttpClient::new()))
        .local_store(store)
        .push_connector(Arc::new(push.clone()))
        .sync_interval(None)
}

async fn harness_with(
    store: Arc<dyn LocalStore>,
    configure: impl FnOnce(SyncClientConfigBuilder) -> SyncClientConfigBuilder,
) -> Harness {
    let push = FakePushConnector::new();
    let config = configure(base_config(Arc::clone(&store), &push))
        .build()
        .unwrap();

    let bus = EventBus::new(256);
    let events = bus.subscribe();
    let api = FakeRecordApi::with_connection(ConnectionMonitor::default().with_event_bus(bus.clone()));
    let credentials = CredentialManager::new(
        Arc::new(StaticCredentialSource::new("token")),
        bus.clone(),
    );
    let deps = SyncDependencies::new(Arc::new(api.clone()), credentials, store, bus)
        .with_push_connector(Arc::new(push.clone()));

    let client = SyncClient::with_dependencies(&config, deps).await.unwrap();
    Harness {
        client,
        api,
        push,
        events,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryLocalStore::new()), |builder| builder).await
}

fn tasks() -> TableRef {
    TableRef::new("app1", "tasks")
}

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

fn server_record(id: &str, name: &str) -> Record {
    Record::new(id, fields(json!({ "Name": name })), chrono::Utc::now())
}

// ============================================================================
// Offline-first behavior
// ============================================================================

#[tokio::test]
async fn test_offline_create_then_sync_assigns_server_id() {
    let h = harness().await;
    let table = tasks();
    h.api.set_offline(true);

    let local = h
        .client
        .create_record(&table, fields(json!({"Name": "A"})))
        .await
        .unwrap();
    assert!(local.id.starts_with("tmp_"));
    assert_eq!(h.client.pending_operations_count(), 1);

    let cached = h
        .client
        .list_records(&table, &ListQuery::new(), ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, local.id);
    assert_eq!(cached[0].fields["Name"], json!("A"));

    h.api.set_offline(false);
    h.client.notify_connectivity_restored().await.unwrap();

    assert_eq!(h.client.pending_operations_count(), 0);
    let cached = h
        .client
        .list_records(&table, &ListQuery::new(), ReadOptions::new().prefer_cache())
        .await
        .unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, "rec1");
    assert_eq!(h.api.records(&table).len(), 1);
}

#[tokio::test]
async fn test_offline_reads_serve_last_snapshot() {
    let mut h = harness().await;
    let table = tasks();
    h.api.insert(&table, server_record("rec1", "b"));
    h.api.insert(&table, server_record("rec2", "a"));

    let online = h
        .client
        .list_records(&table, &ListQuery::new(), ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(online.len(), 2);

    h.api.set_offline(true);
    assert!(!h.client.is_online());

    let query = ListQuery::new().sort_by(SortSpec::asc("Name")).max_records(1);
    let offline = h
        .client
        .list_records(&table, &query, ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].id, "rec2");

    let record = h
        .client
        .get_record(&table, "rec1", ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(record.fields["Name"], json!("b"));

    let mut saw_offline = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, CoreEvent::Connection(ConnectionEvent::Offline { .. })) {
            saw_offline = true;
        }
    }
    assert!(saw_offline);
}

#[tokio::test]
async fn test_network_failure_during_read_falls_back_to_cache() {
    let h = harness().await;
    let table = tasks();
    h.api.insert(&table, server_record("rec1", "cached"));
    h.client.refresh_table(&table).await.unwrap();

    h.api.fail_next(ApiError::Network("connection reset".to_string()));
    let records = h
        .client
        .list_records(&table, &ListQuery::new(), ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!h.client.is_online());
}

#[tokio::test]
async fn test_read_errors_are_classified() {
    let h = harness().await;
    let error = h
        .client
        .get_record(&tasks(), "recMissing", ReadOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Api(ApiError::NotFound(_))));
}

#[tokio::test]
async fn test_pending_local_state_wins_over_network_read() {
    let h = harness().await;
    let table = tasks();
    h.api.insert(&table, server_record("rec1", "server"));
    h.client.refresh_table(&table).await.unwrap();

    h.api.set_offline(true);
    h.client
        .update_record(&table, "rec1", fields(json!({"Name": "local"})))
        .await
        .unwrap();
    // Either the update is still pending or it has already reached the server
    h.api.set_offline(false);

    let records = h
        .client
        .list_records(&table, &ListQuery::new(), ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(records[0].fields["Name"], json!("local"));
}

#[tokio::test]
async fn test_backpressure_surfaces_as_offline() {
    let h = harness_with(Arc::new(MemoryLocalStore::new()), |builder| {
        builder.max_pending_operations(1)
    })
    .await;
    let table = tasks();
    h.api.set_offline(true);

    h.client.create_record(&table, Fields::new()).await.unwrap();
    let error = h
        .client
        .create_record(&table, Fields::new())
        .await
        .unwrap_err();
    assert!(error.is_offline());
}

#[tokio::test]
async fn test_without_offline_queue_writes_pass_through() {
    let h = harness_with(Arc::new(MemoryLocalStore::new()), |builder| {
        builder.enable_offline_queue(false)
    })
    .await;
    let table = tasks();

    let record = h
        .client
        .create_record(&table, fields(json!({"Name": "direct"})))
        .await
        .unwrap();
    assert_eq!(record.id, "rec1");
    assert_eq!(h.client.pending_operations_count(), 0);

    let updated = h
        .client
        .update_record(&table, "rec1", fields(json!({"Name": "changed"})))
        .await
        .unwrap();
    assert_eq!(updated.version, Some(2));

    h.api.set_offline(true);
    let error = h
        .client
        .create_record(&table, Fields::new())
        .await
        .unwrap_err();
    assert!(error.is_offline());
    assert!(h.client.sync().await.unwrap().is_empty());

    h.api.set_offline(false);
    h.client.delete_record(&table, "rec1").await.unwrap();
    assert!(h.api.records(&table).is_empty());
}

#[tokio::test]
async fn test_clear_cache_refuses_tables_with_pending_operations() {
    let h = harness().await;
    let table = tasks();
    h.api.set_offline(true);
    h.client.create_record(&table, Fields::new()).await.unwrap();

    assert!(matches!(
        h.client.clear_cache(&table).await,
        Err(ClientError::Sync(_))
    ));

    h.api.set_offline(false);
    h.client.sync().await.unwrap();
    assert!(h.client.clear_cache(&table).await.unwrap());
}

// ============================================================================
// Attachments and formulas
// ============================================================================

#[tokio::test]
async fn test_upload_requires_synced_record() {
    let h = harness().await;
    let table = tasks();
    h.api.set_offline(true);
    let local = h.client.create_record(&table, Fields::new()).await.unwrap();

    let file = MultipartFile::new("file", "notes.txt", "text/plain", b"hello".to_vec());
    let error = h
        .client
        .upload_attachment(&table, &local.id, "Files", file.clone(), None)
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::NotSynced { .. }));

    h.api.set_offline(false);
    h.client.sync().await.unwrap();

    let progress = Arc::new(AtomicU64::new(0));
    let observed = Arc::clone(&progress);
    let callback: ProgressCallback = Arc::new(move |sent, _total| {
        observed.store(sent, Ordering::SeqCst);
    });
    // The temporary id still resolves after sync
    let record = h
        .client
        .upload_attachment(&table, &local.id, "Files", file, Some(callback))
        .await
        .unwrap();
    assert_eq!(progress.load(Ordering::SeqCst), 5);

    let url = record.fields["Files"][0]["url"].as_str().unwrap().to_string();
    let bytes = h
        .client
        .download_attachment(&url, ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"hello");
}

#[tokio::test]
async fn test_evaluate_formula() {
    let h = harness().await;
    let table = tasks();
    h.api.insert(&table, server_record("rec1", "Ada"));

    let value = h
        .client
        .evaluate_formula(&table, "rec1", "{Name}")
        .await
        .unwrap();
    assert_eq!(value, json!("Ada"));
}

#[tokio::test]
async fn test_cancelled_read() {
    let h = harness().await;
    let token = CancellationToken::new();
    token.cancel();

    let error = h
        .client
        .download_attachment("https://attachments.test/x", ReadOptions::new().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Cancelled));
}

// ============================================================================
// Feed and lifecycle
// ============================================================================

#[tokio::test]
async fn test_subscribe_connects_feed() {
    let mut h = harness().await;
    h.client.subscribe(&tasks()).await.unwrap();

    timeout(Duration::from_secs(5), h.push.wait_for_connects(1))
        .await
        .unwrap();
    let connected = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(CoreEvent::Feed(FeedEvent::Connected { subscriptions })) = h.events.recv().await {
                return subscriptions;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(connected, 1);
    assert_eq!(h.client.subscriptions().await, vec![tasks()]);
}

#[tokio::test]
async fn test_feed_disabled() {
    let h = harness_with(Arc::new(MemoryLocalStore::new()), |builder| {
        builder.enable_realtime_feed(false)
    })
    .await;
    assert!(matches!(
        h.client.subscribe(&tasks()).await,
        Err(ClientError::FeedDisabled)
    ));
}

#[tokio::test]
async fn test_destroy_keeps_pending_operations_for_next_client() {
    let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
    let table = tasks();

    let h = harness_with(Arc::clone(&store), |builder| builder).await;
    h.api.set_offline(true);
    h.client
        .create_record(&table, fields(json!({"Name": "survivor"})))
        .await
        .unwrap();
    h.client.destroy();

    assert!(h.client.is_destroyed());
    assert!(matches!(
        h.client.create_record(&table, Fields::new()).await,
        Err(ClientError::Destroyed)
    ));

    // The restored operation is delivered by the startup drain
    let next = harness_with(store, |builder| builder).await;
    let mut pending = next.client.pending_count_watch();
    timeout(Duration::from_secs(5), pending.wait_for(|count| *count == 0))
        .await
        .unwrap()
        .unwrap();
    let delivered = next.api.records(&table);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].fields["Name"], json!("survivor"));
}

#[tokio::test]
async fn test_connectivity_restored_drains_in_background() {
    let h = harness().await;
    let table = tasks();
    h.api.set_offline(true);
    h.client.create_record(&table, Fields::new()).await.unwrap();

    let mut pending = h.client.pending_count_watch();
    h.api.set_offline(false);

    timeout(Duration::from_secs(5), pending.wait_for(|count| *count == 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.api.records(&table).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_sync_waits_while_offline() {
    let h = harness_with(Arc::new(MemoryLocalStore::new()), |builder| {
        builder.sync_interval(Some(Duration::from_secs(1)))
    })
    .await;
    let table = tasks();
    h.api.set_offline(true);
    h.client.create_record(&table, Fields::new()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.api.writes().is_empty());
    assert_eq!(h.client.pending_operations().await[0].attempt, 0);

    let mut pending = h.client.pending_count_watch();
    h.api.set_offline(false);
    timeout(Duration::from_secs(5), pending.wait_for(|count| *count == 0))
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// Wiring from configuration
// ============================================================================

#[tokio::test]
async fn test_client_from_config_uses_http_transport() {
    let mut http = MockHttpClient::new();
    http.expect_execute().returning(|request| {
        assert_eq!(request.method, HttpMethod::Get);
        assert!(request.url.starts_with("https://api.test/v0/app1/tasks"));
        assert_eq!(
            request.headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
        Ok(HttpResponse::new(
            200,
            json!({"records": [{"id": "rec1", "fields": {"Name": "remote"}}]}).to_string(),
        ))
    });

    let config = SyncClientConfig::builder()
        .credential_source(Arc::new(StaticCredentialSource::new("token")))
        .base_url("https://api.test/")
        .http_client(Arc::new(http))
        .local_store(Arc::new(MemoryLocalStore::new()))
        .enable_realtime_feed(false)
        .sync_interval(None)
        .build()
        .unwrap();
    let client = SyncClient::new(config).await.unwrap();

    let records = client
        .list_records(&tasks(), &ListQuery::new(), ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fields["Name"], json!("remote"));
    assert!(client.is_online());
}
