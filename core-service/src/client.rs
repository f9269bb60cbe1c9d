//! The application-facing client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bridge_traits::http::{MultipartFile, ProgressCallback};
use bridge_traits::Clock;
use bytes::Bytes;
use core_runtime::config::SyncClientConfig;
use core_runtime::events::{ChangeSource, CoreEvent, EventBus, RecordEvent};
use core_sync::{
    is_temp_id, FeedConfig, MutationQueue, PendingOperation, QueueConfig, RealtimeFeed,
    SyncError, SyncResult, SyncState, SyncStore,
};
use provider_records::{
    ApiError, ConnectionMonitor, ConnectionState, Fields, ListQuery, Record, RecordApi, TableRef,
};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{ClientError, Result};
use crate::query::apply_locally;
use crate::SyncDependencies;

/// Per-call options for reads.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Serve from the cache when it has an entry, even while online
    pub prefer_cache: bool,
    pub cancellation: Option<CancellationToken>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefer_cache(mut self) -> Self {
        self.prefer_cache = true;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

struct ClientInner {
    api: Arc<dyn RecordApi>,
    state: Arc<SyncState>,
    queue: MutationQueue,
    feed: Option<RealtimeFeed>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    offline_queue: bool,
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Offline-first client for remote record tables.
///
/// Reads are answered from the network when online and from the local cache
/// otherwise. Writes are applied locally at once and delivered in the
/// background; failures that cannot be retried surface as
/// [`SyncEvent::Error`](core_runtime::events::SyncEvent::Error) events.
///
/// Clones share one client. Background work stops on [`destroy`](Self::destroy)
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Build a client from a validated configuration.
    pub async fn new(config: SyncClientConfig) -> Result<Self> {
        config.validate()?;
        let deps = SyncDependencies::from_config(&config);
        Self::with_dependencies(&config, deps).await
    }

    /// Build a client around explicitly provided dependencies.
    ///
    /// Only the behavioral options of `config` are used; its bridges are
    /// ignored in favor of `deps`.
    pub async fn with_dependencies(
        config: &SyncClientConfig,
        deps: SyncDependencies,
    ) -> Result<Self> {
        let store = SyncStore::new(deps.local_store, config.namespace.clone());
        let state = SyncState::restore(store, deps.event_bus.clone()).await?;
        let shutdown = CancellationToken::new();

        let queue = MutationQueue::new(
            Arc::clone(&state),
            Arc::clone(&deps.api),
            QueueConfig {
                max_pending_operations: config.max_pending_operations,
                max_operation_attempts: config.max_operation_attempts,
                max_pending_operation_age: config.max_pending_operation_age,
            },
            Arc::clone(&deps.clock),
            shutdown.child_token(),
        );

        let feed = match (config.enable_realtime_feed, deps.push_connector) {
            (true, Some(connector)) => Some(RealtimeFeed::new(
                connector,
                deps.credentials.clone(),
                Arc::clone(&state),
                FeedConfig {
                    url: config.feed_url.clone(),
                    retry_policy: config.retry_policy(),
                },
                shutdown.child_token(),
            )),
            (true, None) => {
                warn!("No push connector available, real-time feed disabled");
                None
            }
            (false, _) => None,
        };

        let client = Self {
            inner: Arc::new(ClientInner {
                api: deps.api,
                state,
                queue,
                feed,
                event_bus: deps.event_bus,
                clock: deps.clock,
                offline_queue: config.enable_offline_queue,
                shutdown,
            }),
        };

        if client.inner.offline_queue {
            client.spawn_connectivity_watcher();
            if let Some(period) = config.sync_interval {
                client.spawn_periodic_sync(period);
            }
            if client.pending_operations_count() > 0 && client.is_online() {
                client.spawn_drain();
            }
        }

        info!(
            namespace = %config.namespace,
            pending = client.pending_operations_count(),
            offline_queue = config.enable_offline_queue,
            realtime_feed = client.inner.feed.is_some(),
            "Sync client ready"
        );
        Ok(client)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            Err(ClientError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn validate_table(table: &TableRef) -> Result<()> {
        if table.is_valid() {
            Ok(())
        } else {
            Err(SyncError::InvalidTable(table.to_string()).into())
        }
    }

    fn connection(&self) -> &ConnectionMonitor {
        self.inner.api.connection()
    }

    fn emit_record(&self, event: RecordEvent) {
        let _ = self.inner.event_bus.emit(CoreEvent::Record(event));
    }

    async fn cancellable<T, F>(&self, options: &ReadOptions, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cancellation = options.cancellation.clone().unwrap_or_default();
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ClientError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(ClientError::Destroyed),
            result = future => result,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// List the records of a table.
    ///
    /// Offline, or with [`ReadOptions::prefer_cache`] and a cached entry, the
    /// cached snapshot answers the query. A network failure mid-read falls
    /// back to the cache as well. Queries without filter, projection, limit or
    /// offset refresh the cached snapshot.
    #[instrument(skip(self, query, options), fields(table = %table))]
    pub async fn list_records(
        &self,
        table: &TableRef,
        query: &ListQuery,
        options: ReadOptions,
    ) -> Result<Vec<Record>> {
        self.ensure_active()?;
        Self::validate_table(table)?;

        if options.prefer_cache || !self.is_online() {
            let snapshot = self.inner.state.snapshot(table).await;
            if snapshot.is_some() || !self.is_online() {
                debug!(cached = snapshot.is_some(), "Serving list from cache");
                return Ok(apply_locally(snapshot.as_ref(), query));
            }
        }

        let fetched = self
            .cancellable(&options, self.fetch_pages(table, query))
            .await;
        let records = match fetched {
            Ok(records) => records,
            Err(ClientError::Offline(reason)) => {
                warn!(reason = %reason, "List failed offline, serving cache");
                let snapshot = self.inner.state.snapshot(table).await;
                return Ok(apply_locally(snapshot.as_ref(), query));
            }
            Err(e) => return Err(e),
        };

        let complete = query.filter_formula.is_none()
            && query.fields.is_empty()
            && query.max_records.is_none()
            && query.offset.is_none();

        let mut guard = self.inner.state.lock().await;
        if complete {
            guard
                .replace_table(table, records, self.inner.clock.now())
                .await?;
            return Ok(apply_locally(guard.cache_entry(table), query));
        }

        let mut visible = Vec::with_capacity(records.len());
        for record in records {
            if !guard.has_pending_for(table, &record.id) {
                if query.fields.is_empty() {
                    guard.put_record(table, record.clone()).await?;
                }
                visible.push(record);
                continue;
            }
            // Local state wins while operations are pending; absent means deleted
            if let Some(mut local) = guard.record(table, &record.id).cloned() {
                if !query.fields.is_empty() {
                    local.fields.retain(|name, _| query.fields.contains(name));
                }
                visible.push(local);
            }
        }
        Ok(visible)
    }

    /// Fetch every page of a table and replace its cached snapshot.
    ///
    /// Records with pending local operations keep their local state.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn refresh_table(&self, table: &TableRef) -> Result<usize> {
        self.ensure_active()?;
        Self::validate_table(table)?;

        let records = self.fetch_pages(table, &ListQuery::new()).await?;
        let count = records.len();
        self.inner
            .state
            .lock()
            .await
            .replace_table(table, records, self.inner.clock.now())
            .await?;
        info!(records = count, "Table refreshed");
        Ok(count)
    }

    async fn fetch_pages(&self, table: &TableRef, query: &ListQuery) -> Result<Vec<Record>> {
        let mut page_query = query.clone();
        let mut records = Vec::new();
        loop {
            let page = self.inner.api.list_records(table, &page_query).await?;
            records.extend(page.records);

            if let Some(max) = query.max_records {
                if records.len() >= max as usize {
                    records.truncate(max as usize);
                    break;
                }
            }
            match page.offset {
                Some(offset) => page_query.offset = Some(offset),
                None => break,
            }
        }
        Ok(records)
    }

    /// Fetch one record. Temporary ids and records with pending local
    /// operations are answered from the cache.
    #[instrument(skip(self, options), fields(table = %table))]
    pub async fn get_record(
        &self,
        table: &TableRef,
        record_id: &str,
        options: ReadOptions,
    ) -> Result<Record> {
        self.ensure_active()?;
        Self::validate_table(table)?;

        let (record_id, local, pending) = {
            let guard = self.inner.state.lock().await;
            let resolved = guard.resolve_id(record_id);
            let local = guard.record(table, &resolved).cloned();
            let pending = guard.has_pending_for(table, &resolved);
            (resolved, local, pending)
        };
        let not_found = || ClientError::Api(ApiError::NotFound(format!("{} in {}", record_id, table)));

        if pending || is_temp_id(&record_id) {
            return local.ok_or_else(not_found);
        }
        if options.prefer_cache {
            if let Some(local) = local {
                return Ok(local);
            }
        }
        if !self.is_online() {
            return local.ok_or_else(|| ClientError::Offline(format!("{} is not cached", record_id)));
        }

        let fetched = self
            .cancellable(&options, async {
                Ok(self.inner.api.get_record(table, &record_id).await?)
            })
            .await;

        match fetched {
            Ok(record) => {
                let mut guard = self.inner.state.lock().await;
                if guard.has_pending_for(table, &record.id) {
                    return guard.record(table, &record.id).cloned().ok_or_else(not_found);
                }
                guard.put_record(table, record.clone()).await?;
                Ok(record)
            }
            Err(ClientError::Offline(reason)) => local.ok_or(ClientError::Offline(reason)),
            Err(ClientError::Api(error)) if error.is_not_found() => {
                let mut guard = self.inner.state.lock().await;
                if !guard.has_pending_for(table, &record_id) {
                    guard.remove_record(table, &record_id).await?;
                }
                Err(ClientError::Api(error))
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create a record. With the offline queue the returned record carries a
    /// temporary id until the create is delivered.
    #[instrument(skip(self, fields), fields(table = %table))]
    pub async fn create_record(&self, table: &TableRef, fields: Fields) -> Result<Record> {
        self.ensure_active()?;
        if self.inner.offline_queue {
            return Ok(self.inner.queue.create(table, fields).await?);
        }

        Self::validate_table(table)?;
        let record = self.inner.api.create_record(table, &fields, None).await?;
        self.inner
            .state
            .lock()
            .await
            .put_record(table, record.clone())
            .await?;
        self.emit_record(RecordEvent::Created {
            table: table.to_string(),
            record_id: record.id.clone(),
            source: ChangeSource::Local,
        });
        Ok(record)
    }

    #[instrument(skip(self, fields), fields(table = %table))]
    pub async fn update_record(
        &self,
        table: &TableRef,
        record_id: &str,
        fields: Fields,
    ) -> Result<Record> {
        self.ensure_active()?;
        if self.inner.offline_queue {
            return Ok(self.inner.queue.update(table, record_id, fields).await?);
        }

        Self::validate_table(table)?;
        let record = self
            .inner
            .api
            .update_record(table, record_id, &fields, None)
            .await?;
        self.inner
            .state
            .lock()
            .await
            .put_record(table, record.clone())
            .await?;
        self.emit_record(RecordEvent::Updated {
            table: table.to_string(),
            record_id: record.id.clone(),
            source: ChangeSource::Local,
        });
        Ok(record)
    }

    #[instrument(skip(self), fields(table = %table))]
    pub async fn delete_record(&self, table: &TableRef, record_id: &str) -> Result<()> {
        self.ensure_active()?;
        if self.inner.offline_queue {
            return Ok(self.inner.queue.delete(table, record_id).await?);
        }

        Self::validate_table(table)?;
        match self.inner.api.delete_record(table, record_id).await {
            Err(e) if e.is_not_found() => debug!("Record already absent"),
            other => other?,
        }
        self.inner
            .state
            .lock()
            .await
            .remove_record(table, record_id)
            .await?;
        self.emit_record(RecordEvent::Deleted {
            table: table.to_string(),
            record_id: record_id.to_string(),
            source: ChangeSource::Local,
        });
        Ok(())
    }

    /// Resolve an alias and require a server-side record.
    async fn synced_id(&self, table: &TableRef, record_id: &str) -> Result<String> {
        Self::validate_table(table)?;
        let resolved = self.inner.state.lock().await.resolve_id(record_id);
        if is_temp_id(&resolved) {
            return Err(ClientError::NotSynced {
                record_id: record_id.to_string(),
            });
        }
        Ok(resolved)
    }

    // ========================================================================
    // Attachments and formulas
    // ========================================================================

    /// Upload a file into an attachment field. Requires connectivity.
    #[instrument(skip(self, file, progress), fields(table = %table, field = %field))]
    pub async fn upload_attachment(
        &self,
        table: &TableRef,
        record_id: &str,
        field: &str,
        file: MultipartFile,
        progress: Option<ProgressCallback>,
    ) -> Result<Record> {
        self.ensure_active()?;
        let record_id = self.synced_id(table, record_id).await?;

        let record = self
            .inner
            .api
            .upload_attachment(table, &record_id, field, file, progress)
            .await?;

        let mut guard = self.inner.state.lock().await;
        if !guard.has_pending_for(table, &record.id) {
            guard.put_record(table, record.clone()).await?;
            drop(guard);
            self.emit_record(RecordEvent::Updated {
                table: table.to_string(),
                record_id: record.id.clone(),
                source: ChangeSource::Local,
            });
        }
        Ok(record)
    }

    #[instrument(skip(self, options))]
    pub async fn download_attachment(&self, url: &str, options: ReadOptions) -> Result<Bytes> {
        self.ensure_active()?;
        self.cancellable(&options, async {
            Ok(self.inner.api.download_attachment(url).await?)
        })
        .await
    }

    /// Evaluate a formula in the context of one record on the server.
    #[instrument(skip(self, formula), fields(table = %table))]
    pub async fn evaluate_formula(
        &self,
        table: &TableRef,
        record_id: &str,
        formula: &str,
    ) -> Result<Value> {
        self.ensure_active()?;
        let record_id = self.synced_id(table, record_id).await?;
        Ok(self
            .inner
            .api
            .evaluate_formula(table, &record_id, formula)
            .await?)
    }

    // ========================================================================
    // Real-time feed
    // ========================================================================

    fn feed(&self) -> Result<&RealtimeFeed> {
        self.inner.feed.as_ref().ok_or(ClientError::FeedDisabled)
    }

    /// Keep `table` current with remote changes.
    pub async fn subscribe(&self, table: &TableRef) -> Result<()> {
        self.ensure_active()?;
        Ok(self.feed()?.subscribe(table).await?)
    }

    pub async fn unsubscribe(&self, table: &TableRef) -> Result<()> {
        self.ensure_active()?;
        Ok(self.feed()?.unsubscribe(table).await?)
    }

    pub async fn subscriptions(&self) -> Vec<TableRef> {
        match &self.inner.feed {
            Some(feed) => feed.subscriptions().await,
            None => Vec::new(),
        }
    }

    // ========================================================================
    // Sync status
    // ========================================================================

    /// Run a drain pass over every table with pending operations.
    pub async fn sync(&self) -> Result<SyncResult> {
        self.ensure_active()?;
        if !self.inner.offline_queue {
            return Ok(SyncResult::default());
        }
        Ok(self.inner.queue.drain_all().await?)
    }

    pub fn pending_operations_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.inner.state.pending_operations().await
    }

    pub fn pending_count_watch(&self) -> watch::Receiver<usize> {
        self.inner.state.pending_watch()
    }

    pub fn is_online(&self) -> bool {
        self.connection().is_online()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection().state()
    }

    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.connection().subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    /// Drop a table's cached snapshot. Fails while operations on it are pending.
    pub async fn clear_cache(&self, table: &TableRef) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.inner.state.lock().await.clear_table(table).await?)
    }

    /// Host hint that the network is back. Marks the client online and drains;
    /// a failing delivery flips it back offline.
    pub async fn notify_connectivity_restored(&self) -> Result<SyncResult> {
        self.ensure_active()?;
        self.connection().mark_online();
        self.sync().await
    }

    /// Stop background work, the feed connection and any reconnect timer.
    /// Pending operations stay persisted for the next client.
    pub fn destroy(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if let Some(feed) = &self.inner.feed {
            feed.shutdown();
        }
        self.inner.shutdown.cancel();
        info!(
            pending = self.pending_operations_count(),
            "Sync client destroyed"
        );
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ========================================================================
    // Background work
    // ========================================================================

    fn spawn_drain(&self) {
        let queue = self.inner.queue.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = queue.drain_all() => {
                    if let Err(e) = result {
                        warn!("Startup drain failed: {}", e);
                    }
                }
            }
        });
    }

    /// Drain whenever the connection comes back.
    fn spawn_connectivity_watcher(&self) {
        let queue = self.inner.queue.clone();
        let shutdown = self.inner.shutdown.clone();
        let mut connection = self.connection().subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = connection.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *connection.borrow_and_update() != ConnectionState::Online {
                    continue;
                }

                info!("Connection restored, draining pending operations");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = queue.drain_all() => {
                        if let Err(e) = result {
                            warn!("Drain after reconnect failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Periodic drain. Skipped while offline so failed deliveries do not use
    /// up the attempt budget; the connectivity watcher drains on recovery.
    fn spawn_periodic_sync(&self, period: Duration) {
        let queue = self.inner.queue.clone();
        let shutdown = self.inner.shutdown.clone();
        let connection = self.connection().clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if queue.pending_count() == 0 || !connection.is_online() {
                    continue;
                }

                debug!(pending = queue.pending_count(), "Periodic drain");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = queue.drain_all() => {
                        if let Err(e) = result {
                            warn!("Periodic drain failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("online", &self.is_online())
            .field("pending", &self.pending_operations_count())
            .field("offline_queue", &self.inner.offline_queue)
            .field("realtime_feed", &self.inner.feed.is_some())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
