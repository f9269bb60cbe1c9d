//! # Mutation Queue
//!
//! Optimistic writes and ordered delivery of pending operations.
//!
//! ## Overview
//!
//! Every mutation is appended to the pending-operation log and applied to the
//! cached table before the call returns. Drain passes deliver the log to the
//! remote API:
//!
//! - Tables drain independently and concurrently; within a table the log is
//!   delivered strictly head first, so an Update never overtakes the Create
//!   it depends on.
//! - A successful Create replaces the temporary id everywhere: the cache,
//!   later operations in the log, and an alias for callers still holding it.
//! - Non-retryable rejections drop the operation and emit `SyncEvent::Error`
//!   with the original payload. A dropped Create takes its dependents along.
//! - Transient failures stop the table's pass. Network failures leave the
//!   attempt budget untouched; other transient failures consume one attempt
//!   and drop the operation once `max_operation_attempts` is reached.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let queue = MutationQueue::new(state, api, QueueConfig::default(), clock, shutdown);
//!
//! let record = queue.create(&table, fields).await?;   // temporary id
//! let result = queue.drain_all().await?;               // remapped to server id
//! ```

use bridge_traits::Clock;
use core_runtime::events::{
    ChangeSource, CoreEvent, DropReason, FailedOperation, RecordEvent, SyncEvent,
};
use futures::future::join_all;
use provider_records::{ApiError, Fields, Record, RecordApi, TableRef};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::state::{StateGuard, SyncState};
use crate::types::{
    is_temp_id, new_temp_id, OperationKind, OperationStatus, PendingOperation, SyncResult,
};

/// Queue limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// New mutations are rejected once this many operations are pending
    pub max_pending_operations: usize,
    /// Drain attempts before an operation is dropped
    pub max_operation_attempts: u32,
    /// Operations older than this are dropped at drain time
    pub max_pending_operation_age: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_operations: 10_000,
            max_operation_attempts: 5,
            max_pending_operation_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

/// Result of one delivery attempt.
enum Delivery {
    Confirmed(Option<Record>),
    /// Stays at the head; the table's pass stops
    Retry(ApiError),
    Rejected(ApiError),
    Malformed(String),
}

/// The mutation queue manager.
#[derive(Clone)]
pub struct MutationQueue {
    state: Arc<SyncState>,
    api: Arc<dyn RecordApi>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    /// Serializes drain passes per table
    drain_locks: Arc<Mutex<HashMap<TableRef, Arc<Mutex<()>>>>>,
    shutdown: CancellationToken,
}

impl MutationQueue {
    pub fn new(
        state: Arc<SyncState>,
        api: Arc<dyn RecordApi>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            api,
            config,
            clock,
            drain_locks: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending_count()
    }

    fn validate_table(table: &TableRef) -> Result<()> {
        if table.is_valid() {
            Ok(())
        } else {
            Err(SyncError::InvalidTable(table.to_string()))
        }
    }

    fn validate_target(operation: &str, record_id: &str) -> Result<()> {
        if record_id.trim().is_empty() {
            Err(SyncError::MissingRecordId {
                operation: operation.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn check_capacity(&self, guard: &StateGuard<'_>) -> Result<()> {
        if guard.pending_len() >= self.config.max_pending_operations {
            warn!(
                limit = self.config.max_pending_operations,
                "Pending operation log full, rejecting mutation"
            );
            return Err(SyncError::QueueFull {
                limit: self.config.max_pending_operations,
            });
        }
        Ok(())
    }

    /// Resolve aliases and reject temporary ids whose Create was dropped.
    fn resolve_target(guard: &StateGuard<'_>, table: &TableRef, record_id: &str) -> Result<String> {
        let resolved = guard.resolve_id(record_id);
        if is_temp_id(&resolved) && !guard.has_pending_create(&resolved) {
            return Err(SyncError::UnknownRecord {
                table: table.to_string(),
                record_id: record_id.to_string(),
            });
        }
        Ok(resolved)
    }

    fn emit_record(&self, event: RecordEvent) {
        let _ = self.state.event_bus().emit(CoreEvent::Record(event));
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Queue a Create and insert the record under a temporary id.
    #[instrument(skip(self, fields), fields(table = %table))]
    pub async fn create(&self, table: &TableRef, fields: Fields) -> Result<Record> {
        Self::validate_table(table)?;

        let mut guard = self.state.lock().await;
        self.check_capacity(&guard)?;

        let now = self.clock.now();
        let temp_id = new_temp_id();
        let record = Record::new(temp_id.clone(), fields.clone(), now);

        let op = guard
            .append_operation(PendingOperation::create(table.clone(), temp_id.clone(), fields, now))
            .await?;
        guard.put_record(table, record.clone()).await?;
        drop(guard);

        debug!(op_id = %op.op_id, temp_id = %temp_id, "Queued create");
        self.emit_record(RecordEvent::Created {
            table: table.to_string(),
            record_id: temp_id,
            source: ChangeSource::Local,
        });
        self.schedule_drain(table.clone());
        Ok(record)
    }

    /// Queue an Update and merge `fields` into the cached record.
    ///
    /// A record missing from the cache is inserted with just the patched
    /// fields so later reads still see the write.
    #[instrument(skip(self, fields), fields(table = %table))]
    pub async fn update(&self, table: &TableRef, record_id: &str, fields: Fields) -> Result<Record> {
        Self::validate_table(table)?;
        Self::validate_target("update", record_id)?;

        let mut guard = self.state.lock().await;
        self.check_capacity(&guard)?;
        let target = Self::resolve_target(&guard, table, record_id)?;

        let now = self.clock.now();
        let mut record = guard
            .record(table, &target)
            .cloned()
            .unwrap_or_else(|| Record::new(target.clone(), Fields::new(), now));
        record.merge_fields(&fields);

        let op = guard
            .append_operation(PendingOperation::update(table.clone(), target.clone(), fields, now))
            .await?;
        guard.put_record(table, record.clone()).await?;
        drop(guard);

        debug!(op_id = %op.op_id, record_id = %target, "Queued update");
        self.emit_record(RecordEvent::Updated {
            table: table.to_string(),
            record_id: target,
            source: ChangeSource::Local,
        });
        self.schedule_drain(table.clone());
        Ok(record)
    }

    /// Queue a Delete and remove the record from the cache.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn delete(&self, table: &TableRef, record_id: &str) -> Result<()> {
        Self::validate_table(table)?;
        Self::validate_target("delete", record_id)?;

        let mut guard = self.state.lock().await;
        self.check_capacity(&guard)?;
        let target = Self::resolve_target(&guard, table, record_id)?;

        let now = self.clock.now();
        let op = guard
            .append_operation(PendingOperation::delete(table.clone(), target.clone(), now))
            .await?;
        guard.remove_record(table, &target).await?;
        drop(guard);

        debug!(op_id = %op.op_id, record_id = %target, "Queued delete");
        self.emit_record(RecordEvent::Deleted {
            table: table.to_string(),
            record_id: target,
            source: ChangeSource::Local,
        });
        self.schedule_drain(table.clone());
        Ok(())
    }

    /// Start a background drain of `table` when the connection is up.
    pub fn schedule_drain(&self, table: TableRef) {
        if !self.api.connection().is_online() || self.shutdown.is_cancelled() {
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            let shutdown = queue.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = queue.drain_tables(vec![table]) => {
                    if let Err(e) = result {
                        error!("Background drain failed: {}", e);
                    }
                }
            }
        });
    }

    // ========================================================================
    // Drain
    // ========================================================================

    /// Drain every table with pending operations.
    pub async fn drain_all(&self) -> Result<SyncResult> {
        let tables = self.state.lock().await.tables_with_pending();
        self.drain_tables(tables).await
    }

    /// Drain one table.
    pub async fn drain_table(&self, table: &TableRef) -> Result<SyncResult> {
        self.drain_tables(vec![table.clone()]).await
    }

    /// Run one pass over `tables`, emitting lifecycle events when there is
    /// work. An empty queue makes no calls and emits nothing.
    #[instrument(skip(self, tables), fields(tables = tables.len()))]
    async fn drain_tables(&self, tables: Vec<TableRef>) -> Result<SyncResult> {
        let (tables, pending) = {
            let guard = self.state.lock().await;
            let tables: Vec<TableRef> = tables
                .into_iter()
                .filter(|table| guard.head_operation(table).is_some())
                .collect();
            let pending: usize = tables
                .iter()
                .map(|table| guard.operations_for(table).count())
                .sum();
            (tables, pending)
        };

        if tables.is_empty() {
            return Ok(SyncResult::default());
        }

        let started = Instant::now();
        let _ = self.state.event_bus().emit(CoreEvent::Sync(SyncEvent::Started {
            tables: tables.iter().map(ToString::to_string).collect(),
            pending: pending as u64,
        }));
        info!(pending, "Drain pass started");

        let outcomes = join_all(tables.iter().map(|table| self.drain_one(table))).await;

        let mut result = SyncResult::default();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(partial) => result.merge(partial),
                Err(e) => {
                    error!("Drain pass failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = self.state.event_bus().emit(CoreEvent::Sync(SyncEvent::Completed {
            applied: result.applied.iter().map(|id| id.as_str()).collect(),
            failed: result.failed.clone(),
            remaining: result.remaining as u64,
            duration_ms,
        }));
        info!(
            applied = result.applied.len(),
            failed = result.failed.len(),
            remaining = result.remaining,
            duration_ms,
            "Drain pass completed"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    async fn drain_lock(&self, table: &TableRef) -> Arc<Mutex<()>> {
        let mut locks = self.drain_locks.lock().await;
        locks
            .entry(table.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn drain_one(&self, table: &TableRef) -> Result<SyncResult> {
        let lock = self.drain_lock(table).await;
        let _guard = lock.lock().await;

        let mut result = SyncResult::default();
        self.expire_operations(table, &mut result).await?;

        loop {
            let op = {
                let mut guard = self.state.lock().await;
                let Some(mut op) = guard.head_operation(table) else {
                    break;
                };
                op.status = OperationStatus::InFlight;
                guard.update_operation(&op).await?;
                op
            };

            debug!(op_id = %op.op_id, kind = op.kind.as_str(), attempt = op.attempt, "Delivering operation");
            let delivery = self.deliver(&op).await;

            let mut guard = self.state.lock().await;
            match delivery {
                Delivery::Confirmed(server_record) => {
                    self.confirm(&mut guard, &op, server_record).await?;
                    result.applied.push(op.op_id);
                }
                Delivery::Rejected(error) => {
                    self.drop_operation(
                        &mut guard,
                        &op,
                        DropReason::Rejected,
                        &error.to_string(),
                        &mut result,
                    )
                    .await?;
                    if op.kind == OperationKind::Update && error.is_not_found() {
                        self.forget_missing(&mut guard, &op).await?;
                    }
                }
                Delivery::Malformed(message) => {
                    self.drop_operation(&mut guard, &op, DropReason::Rejected, &message, &mut result)
                        .await?;
                }
                Delivery::Retry(error) => {
                    let mut op = op;
                    op.last_error = Some(error.to_string());
                    op.attempt += 1;

                    if op.attempt >= self.config.max_operation_attempts {
                        let message = format!(
                            "gave up after {} attempts: {}",
                            op.attempt, error
                        );
                        self.drop_operation(
                            &mut guard,
                            &op,
                            DropReason::RetriesExhausted,
                            &message,
                            &mut result,
                        )
                        .await?;
                        continue;
                    }

                    op.status = OperationStatus::Failed;
                    guard.update_operation(&op).await?;
                    warn!(
                        op_id = %op.op_id,
                        attempt = op.attempt,
                        status = op.status.as_str(),
                        "Operation failed transiently, stopping pass for table: {}",
                        error
                    );
                    result.failed.push(FailedOperation {
                        op_id: op.op_id.as_str(),
                        error: error.to_string(),
                        permanent: false,
                    });
                    break;
                }
            }
        }

        let remaining = self.state.lock().await.operations_for(table).count();
        result.remaining = remaining;

        self.state.replay_deferred(table).await?;
        Ok(result)
    }

    /// Drop every operation of `table` older than the configured maximum age,
    /// and forget id aliases of the same age.
    async fn expire_operations(&self, table: &TableRef, result: &mut SyncResult) -> Result<()> {
        let Some(max_age) = self.config.max_pending_operation_age else {
            return Ok(());
        };
        let now = self.clock.now();

        let mut guard = self.state.lock().await;
        let expired: Vec<PendingOperation> = guard
            .operations_for(table)
            .filter(|op| op.is_expired(now, max_age))
            .cloned()
            .collect();

        for op in expired {
            // A cascade from an earlier expired Create may have removed it
            if guard.operations_for(table).all(|o| o.seq != op.seq) {
                continue;
            }
            let message = format!("operation older than {}s", max_age.as_secs());
            self.drop_operation(&mut guard, &op, DropReason::Expired, &message, result)
                .await?;
        }

        if let Ok(max_age) = chrono::Duration::from_std(max_age) {
            guard.prune_aliases(table, now - max_age).await?;
        }
        Ok(())
    }

    async fn deliver(&self, op: &PendingOperation) -> Delivery {
        let idempotency_key = op.op_id.as_str();
        let payload = op.payload.clone().unwrap_or_default();

        let outcome = match (op.kind, op.target_id.as_deref()) {
            (OperationKind::Create, _) => self
                .api
                .create_record(&op.table, &payload, Some(&idempotency_key))
                .await
                .map(Some),
            (OperationKind::Update, Some(target)) => self
                .api
                .update_record(&op.table, target, &payload, Some(&idempotency_key))
                .await
                .map(Some),
            (OperationKind::Delete, Some(target)) => {
                match self.api.delete_record(&op.table, target).await {
                    Err(e) if e.is_not_found() => {
                        debug!(op_id = %op.op_id, "Record already absent, delete confirmed");
                        Ok(None)
                    }
                    other => other.map(|_| None),
                }
            }
            (kind, None) => {
                return Delivery::Malformed(format!(
                    "{} operation has no target id",
                    kind.as_str()
                ))
            }
        };

        match outcome {
            Ok(record) => Delivery::Confirmed(record),
            Err(e) if e.is_transient() => Delivery::Retry(e),
            Err(e) => Delivery::Rejected(e),
        }
    }

    /// Apply a confirmed operation to the cache and remove it from the log.
    async fn confirm(
        &self,
        guard: &mut StateGuard<'_>,
        op: &PendingOperation,
        server_record: Option<Record>,
    ) -> Result<()> {
        guard.remove_operation(op.seq).await?;

        let Some(server_record) = server_record else {
            debug!(op_id = %op.op_id, "Delete confirmed");
            return Ok(());
        };

        let table = &op.table;
        let server_id = server_record.id.clone();

        if op.kind == OperationKind::Create {
            if let Some(temp_id) = op.temp_id.as_deref() {
                let had_local = guard.remove_record(table, temp_id).await?.is_some();
                let remapped = guard
                    .remap_operations(table, temp_id, &server_id, self.clock.now())
                    .await?;
                info!(
                    op_id = %op.op_id,
                    temp_id = %temp_id,
                    server_id = %server_id,
                    remapped,
                    "Create confirmed, temporary id remapped"
                );
                self.emit_record(RecordEvent::IdRemapped {
                    table: table.to_string(),
                    temp_id: temp_id.to_string(),
                    server_id: server_id.clone(),
                });
                if !had_local && remapped == 0 {
                    return Ok(());
                }
            }
        }

        self.store_confirmed(guard, table, server_record).await
    }

    /// Cache the server's record, re-applying later local operations on it.
    async fn store_confirmed(
        &self,
        guard: &mut StateGuard<'_>,
        table: &TableRef,
        mut record: Record,
    ) -> Result<()> {
        let mut deleted_later = false;
        let record_id = record.id.clone();
        for later in guard.operations_for(table).filter(|o| o.targets(&record_id)) {
            match later.kind {
                OperationKind::Update => {
                    if let Some(payload) = &later.payload {
                        record.merge_fields(payload);
                    }
                }
                OperationKind::Delete => deleted_later = true,
                OperationKind::Create => {}
            }
        }

        if deleted_later {
            guard.remove_record(table, &record.id).await?;
        } else {
            guard.put_record(table, record).await?;
        }
        Ok(())
    }

    /// Remove `op` from the log, report it, and cascade to dependents.
    async fn drop_operation(
        &self,
        guard: &mut StateGuard<'_>,
        op: &PendingOperation,
        reason: DropReason,
        message: &str,
        result: &mut SyncResult,
    ) -> Result<()> {
        guard.remove_operation(op.seq).await?;
        self.report_dropped(op, reason, message, result);

        match op.kind {
            OperationKind::Create => {
                let Some(temp_id) = op.temp_id.as_deref() else {
                    return Ok(());
                };
                let dependents: Vec<PendingOperation> = guard
                    .operations_for(&op.table)
                    .filter(|o| o.targets(temp_id))
                    .cloned()
                    .collect();
                for dependent in dependents {
                    guard.remove_operation(dependent.seq).await?;
                    let message = format!("depends on dropped create {}", op.op_id);
                    self.report_dropped(&dependent, DropReason::DependencyDropped, &message, result);
                }
                if guard.remove_record(&op.table, temp_id).await?.is_some() {
                    self.emit_record(RecordEvent::Deleted {
                        table: op.table.to_string(),
                        record_id: temp_id.to_string(),
                        source: ChangeSource::Local,
                    });
                }
            }
            OperationKind::Update | OperationKind::Delete => {}
        }
        Ok(())
    }

    /// Evict a record the server reported missing, unless later local
    /// operations still target it.
    async fn forget_missing(&self, guard: &mut StateGuard<'_>, op: &PendingOperation) -> Result<()> {
        let Some(target) = op.target_id.as_deref() else {
            return Ok(());
        };
        if guard.has_pending_for(&op.table, target) {
            return Ok(());
        }
        if guard.remove_record(&op.table, target).await?.is_some() {
            self.emit_record(RecordEvent::Deleted {
                table: op.table.to_string(),
                record_id: target.to_string(),
                source: ChangeSource::Remote,
            });
        }
        Ok(())
    }

    fn report_dropped(
        &self,
        op: &PendingOperation,
        reason: DropReason,
        message: &str,
        result: &mut SyncResult,
    ) {
        warn!(
            op_id = %op.op_id,
            table = %op.table,
            kind = op.kind.as_str(),
            reason = reason.as_str(),
            "Dropping pending operation: {}",
            message
        );
        let _ = self.state.event_bus().emit(CoreEvent::Sync(SyncEvent::Error {
            op_id: op.op_id.as_str(),
            table: op.table.to_string(),
            kind: op.kind.as_str().to_string(),
            target_id: op.target_id.clone().or_else(|| op.temp_id.clone()),
            payload: op.payload.clone().map(Value::Object),
            reason,
            message: message.to_string(),
        }));
        result.failed.push(FailedOperation {
            op_id: op.op_id.as_str(),
            error: message.to_string(),
            permanent: true,
        });
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}
