//! In-memory stand-ins for the remote API and the push feed.
//!
//! Enabled for unit tests and, through the `test-support` feature, for
//! integration tests of downstream crates.

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{MultipartFile, ProgressCallback};
use bridge_traits::{PushConnection, PushConnector};
use bytes::Bytes;
use chrono::Utc;
use provider_records::{
    ApiError, ConnectionMonitor, ConnectionState, Fields, ListQuery, Record, RecordApi,
    RecordPage, TableRef,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Remote API
// ============================================================================

/// One request seen by [`FakeRecordApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    List(TableRef),
    Get(TableRef, String),
    Create {
        table: TableRef,
        fields: Fields,
        idempotency_key: Option<String>,
    },
    Update {
        table: TableRef,
        record_id: String,
        fields: Fields,
        idempotency_key: Option<String>,
    },
    Delete(TableRef, String),
    Upload(TableRef, String, String),
    Download(String),
    Evaluate(TableRef, String, String),
}

#[derive(Default)]
struct FakeServer {
    tables: HashMap<TableRef, BTreeMap<String, Record>>,
    failures: VecDeque<ApiError>,
    offline: bool,
    replies: HashMap<String, Record>,
    calls: Vec<ApiCall>,
    attachments: HashMap<String, Bytes>,
    next_id: u64,
}

/// A record server held in memory.
///
/// Server ids are `rec{n}`. Creates and updates bump `version`. Requests
/// carrying a known idempotency key return the first reply unchanged.
#[derive(Clone)]
pub struct FakeRecordApi {
    server: Arc<Mutex<FakeServer>>,
    connection: ConnectionMonitor,
}

impl Default for FakeRecordApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRecordApi {
    pub fn new() -> Self {
        Self::with_connection(ConnectionMonitor::new(ConnectionState::Online))
    }

    pub fn with_connection(connection: ConnectionMonitor) -> Self {
        Self {
            server: Arc::new(Mutex::new(FakeServer::default())),
            connection,
        }
    }

    /// Seed a server-side record.
    pub fn insert(&self, table: &TableRef, record: Record) {
        lock(&self.server)
            .tables
            .entry(table.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn remove(&self, table: &TableRef, record_id: &str) -> Option<Record> {
        lock(&self.server)
            .tables
            .get_mut(table)
            .and_then(|records| records.remove(record_id))
    }

    pub fn records(&self, table: &TableRef) -> Vec<Record> {
        lock(&self.server)
            .tables
            .get(table)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, table: &TableRef, record_id: &str) -> Option<Record> {
        lock(&self.server)
            .tables
            .get(table)
            .and_then(|records| records.get(record_id).cloned())
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.server).calls.clone()
    }

    /// Mutating calls only, in order.
    pub fn writes(&self) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(
                    call,
                    ApiCall::Create { .. } | ApiCall::Update { .. } | ApiCall::Delete(..)
                )
            })
            .collect()
    }

    /// Fail the next request with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: ApiError) {
        lock(&self.server).failures.push_back(error);
    }

    /// While offline every request fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.server).offline = offline;
        if offline {
            self.connection.mark_offline("network unreachable");
        } else {
            self.connection.mark_online();
        }
    }

    pub fn put_attachment(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        lock(&self.server).attachments.insert(url.into(), data.into());
    }

    fn begin(&self, call: ApiCall) -> Result<MutexGuard<'_, FakeServer>, ApiError> {
        let mut server = lock(&self.server);
        server.calls.push(call);
        if server.offline {
            drop(server);
            self.connection.mark_offline("network unreachable");
            return Err(ApiError::Network("network unreachable".to_string()));
        }
        if let Some(error) = server.failures.pop_front() {
            drop(server);
            if error.is_network() {
                self.connection.mark_offline(error.to_string());
            } else {
                self.connection.mark_online();
            }
            return Err(error);
        }
        self.connection.mark_online();
        Ok(server)
    }

    fn not_found(table: &TableRef, record_id: &str) -> ApiError {
        ApiError::NotFound(format!("{} in {}", record_id, table))
    }
}

#[async_trait]
impl RecordApi for FakeRecordApi {
    fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    async fn list_records(
        &self,
        table: &TableRef,
        query: &ListQuery,
    ) -> provider_records::Result<RecordPage> {
        let server = self.begin(ApiCall::List(table.clone()))?;
        let mut records: Vec<Record> = server
            .tables
            .get(table)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        if let Some(max) = query.max_records {
            records.truncate(max as usize);
        }
        Ok(RecordPage {
            records,
            offset: None,
        })
    }

    async fn get_record(&self, table: &TableRef, record_id: &str) -> provider_records::Result<Record> {
        let server = self.begin(ApiCall::Get(table.clone(), record_id.to_string()))?;
        server
            .tables
            .get(table)
            .and_then(|records| records.get(record_id).cloned())
            .ok_or_else(|| Self::not_found(table, record_id))
    }

    async fn create_record(
        &self,
        table: &TableRef,
        fields: &Fields,
        idempotency_key: Option<&str>,
    ) -> provider_records::Result<Record> {
        let mut server = self.begin(ApiCall::Create {
            table: table.clone(),
            fields: fields.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
        })?;
        if let Some(reply) = idempotency_key.and_then(|key| server.replies.get(key)) {
            return Ok(reply.clone());
        }

        server.next_id += 1;
        let now = Utc::now();
        let mut record = Record::new(format!("rec{}", server.next_id), fields.clone(), now);
        record.updated_at = Some(now);
        record.version = Some(1);

        server
            .tables
            .entry(table.clone())
            .or_default()
            .insert(record.id.clone(), record.clone());
        if let Some(key) = idempotency_key {
            server.replies.insert(key.to_string(), record.clone());
        }
        Ok(record)
    }

    async fn update_record(
        &self,
        table: &TableRef,
        record_id: &str,
        fields: &Fields,
        idempotency_key: Option<&str>,
    ) -> provider_records::Result<Record> {
        let mut server = self.begin(ApiCall::Update {
            table: table.clone(),
            record_id: record_id.to_string(),
            fields: fields.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
        })?;
        if let Some(reply) = idempotency_key.and_then(|key| server.replies.get(key)) {
            return Ok(reply.clone());
        }

        let record = server
            .tables
            .get_mut(table)
            .and_then(|records| records.get_mut(record_id))
            .ok_or_else(|| Self::not_found(table, record_id))?;
        record.merge_fields(fields);
        record.updated_at = Some(Utc::now());
        record.version = Some(record.version.unwrap_or(0) + 1);
        let record = record.clone();

        if let Some(key) = idempotency_key {
            server.replies.insert(key.to_string(), record.clone());
        }
        Ok(record)
    }

    async fn delete_record(&self, table: &TableRef, record_id: &str) -> provider_records::Result<()> {
        let mut server = self.begin(ApiCall::Delete(table.clone(), record_id.to_string()))?;
        server
            .tables
            .get_mut(table)
            .and_then(|records| records.remove(record_id))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(table, record_id))
    }

    async fn upload_attachment(
        &self,
        table: &TableRef,
        record_id: &str,
        field: &str,
        file: MultipartFile,
        progress: Option<ProgressCallback>,
    ) -> provider_records::Result<Record> {
        let mut server = self.begin(ApiCall::Upload(
            table.clone(),
            record_id.to_string(),
            field.to_string(),
        ))?;
        let total = file.data.len() as u64;
        if let Some(progress) = progress {
            progress(total, total);
        }

        let url = format!("https://attachments.test/{}/{}", record_id, file.file_name);
        server.attachments.insert(url.clone(), file.data.clone());

        let record = server
            .tables
            .get_mut(table)
            .and_then(|records| records.get_mut(record_id))
            .ok_or_else(|| Self::not_found(table, record_id))?;
        record.fields.insert(
            field.to_string(),
            json!([{ "url": url, "filename": file.file_name, "type": file.content_type, "size": total }]),
        );
        record.version = Some(record.version.unwrap_or(0) + 1);
        Ok(record.clone())
    }

    async fn download_attachment(&self, url: &str) -> provider_records::Result<Bytes> {
        let server = self.begin(ApiCall::Download(url.to_string()))?;
        server
            .attachments
            .get(url)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(url.to_string()))
    }

    /// Supports bare field references (`{Name}`) only.
    async fn evaluate_formula(
        &self,
        table: &TableRef,
        record_id: &str,
        formula: &str,
    ) -> provider_records::Result<Value> {
        let server = self.begin(ApiCall::Evaluate(
            table.clone(),
            record_id.to_string(),
            formula.to_string(),
        ))?;
        let record = server
            .tables
            .get(table)
            .and_then(|records| records.get(record_id))
            .ok_or_else(|| Self::not_found(table, record_id))?;

        let field = formula.trim().trim_start_matches('{').trim_end_matches('}');
        Ok(record.fields.get(field).cloned().unwrap_or(Value::Null))
    }
}

// ============================================================================
// Push feed
// ============================================================================

#[derive(Default)]
struct FakeFeedServer {
    outbound: Option<mpsc::UnboundedSender<BridgeResult<String>>>,
    sent: Vec<String>,
    failing_connects: usize,
}

/// A push server held in memory.
///
/// Every successful `connect` replaces the current connection. Messages the
/// client sends are recorded; [`push`](FakePushConnector::push) delivers to
/// the current connection.
#[derive(Clone)]
pub struct FakePushConnector {
    server: Arc<Mutex<FakeFeedServer>>,
    connects: Arc<watch::Sender<usize>>,
    sent_count: Arc<watch::Sender<usize>>,
}

impl Default for FakePushConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePushConnector {
    pub fn new() -> Self {
        Self {
            server: Arc::new(Mutex::new(FakeFeedServer::default())),
            connects: Arc::new(watch::channel(0).0),
            sent_count: Arc::new(watch::channel(0).0),
        }
    }

    /// Deliver a message to the open connection. False when none is open.
    pub fn push(&self, message: impl Into<String>) -> bool {
        match lock(&self.server).outbound.as_ref() {
            Some(outbound) => outbound.send(Ok(message.into())).is_ok(),
            None => false,
        }
    }

    /// Deliver a serialized feed message.
    pub fn push_json(&self, message: &Value) -> bool {
        self.push(message.to_string())
    }

    /// Close the open connection from the server side.
    pub fn drop_connection(&self) {
        lock(&self.server).outbound = None;
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.server).failing_connects = count;
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.borrow()
    }

    pub fn sent_messages(&self) -> Vec<String> {
        lock(&self.server).sent.clone()
    }

    /// Sent messages parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent_messages()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub async fn wait_for_connects(&self, count: usize) {
        let mut receiver = self.connects.subscribe();
        let _ = receiver.wait_for(|connects| *connects >= count).await;
    }

    pub async fn wait_for_sent(&self, count: usize) {
        let mut receiver = self.sent_count.subscribe();
        let _ = receiver.wait_for(|sent| *sent >= count).await;
    }
}

#[async_trait]
impl PushConnector for FakePushConnector {
    async fn connect(&self, _url: &str, _bearer_token: &str) -> BridgeResult<Box<dyn PushConnection>> {
        let (outbound, inbound) = mpsc::unbounded_channel();
        {
            let mut server = lock(&self.server);
            if server.failing_connects > 0 {
                server.failing_connects -= 1;
                return Err(BridgeError::Network("connection refused".to_string()));
            }
            server.outbound = Some(outbound);
        }
        self.connects.send_modify(|connects| *connects += 1);

        Ok(Box::new(FakePushConnection {
            inbound,
            server: Arc::clone(&self.server),
            sent_count: Arc::clone(&self.sent_count),
        }))
    }
}

struct FakePushConnection {
    inbound: mpsc::UnboundedReceiver<BridgeResult<String>>,
    server: Arc<Mutex<FakeFeedServer>>,
    sent_count: Arc<watch::Sender<usize>>,
}

#[async_trait]
impl PushConnection for FakePushConnection {
    async fn send(&mut self, message: String) -> BridgeResult<()> {
        lock(&self.server).sent.push(message);
        self.sent_count.send_modify(|sent| *sent += 1);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<BridgeResult<String>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> BridgeResult<()> {
        self.inbound.close();
        Ok(())
    }
}

/// A `record.updated`/`record.created` feed message.
pub fn record_message(event_type: &str, table: &TableRef, record: &Record, sequence: u64) -> Value {
    json!({
        "type": event_type,
        "tableRef": { "baseId": table.base_id, "tableId": table.table_id },
        "payload": { "record": record },
        "sequence": sequence,
    })
}

/// A `record.deleted` feed message.
pub fn delete_message(table: &TableRef, record_id: &str, sequence: u64) -> Value {
    json!({
        "type": "record.deleted",
        "tableRef": { "baseId": table.base_id, "tableId": table.table_id },
        "payload": { "recordId": record_id },
        "sequence": sequence,
    })
}
