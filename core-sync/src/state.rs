//! # Shared Table State
//!
//! The cache entries, the pending-operation log and the feed bookkeeping
//! live behind one async mutex shared by the mutation queue and the
//! real-time feed. Every read-modify-write of a cache entry goes through a
//! [`StateGuard`], which also writes the change through to the
//! [`SyncStore`] before releasing the lock.
//!
//! Remote changes for a record with a queued or in-flight local operation
//! are deferred and replayed after the queue's drain pass for that table.

use chrono::{DateTime, Utc};
use core_runtime::events::{ChangeSource, CoreEvent, EventBus, RecordEvent};
use provider_records::{Record, TableRef};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::store::SyncStore;
use crate::types::{CacheEntry, IdAlias, OperationKind, PendingOperation, TableMeta};

/// A change pushed by the real-time feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub table: TableRef,
    pub sequence: u64,
    pub kind: RemoteChangeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChangeKind {
    /// Record created or updated
    Upsert(Record),
    Delete { record_id: String },
}

impl RemoteChange {
    pub fn record_id(&self) -> &str {
        match &self.kind {
            RemoteChangeKind::Upsert(record) => &record.id,
            RemoteChangeKind::Delete { record_id } => record_id,
        }
    }
}

/// What happened to a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Buffered until the local operation on the same record resolves
    Deferred,
    /// Older than the cached record; discarded
    Stale,
}

#[derive(Default)]
struct StateInner {
    caches: HashMap<TableRef, CacheEntry>,
    /// Pending operations keyed by log sequence
    log: BTreeMap<u64, PendingOperation>,
    deferred: HashMap<TableRef, Vec<RemoteChange>>,
    last_sequence: HashMap<TableRef, u64>,
    aliases: HashMap<String, IdAlias>,
    next_seq: u64,
}

/// State shared by the mutation queue and the feed client.
pub struct SyncState {
    inner: Mutex<StateInner>,
    store: SyncStore,
    event_bus: EventBus,
    pending_tx: watch::Sender<usize>,
}

impl SyncState {
    /// Load persisted state from `store`.
    pub async fn restore(store: SyncStore, event_bus: EventBus) -> Result<Arc<Self>> {
        let persisted = store.load().await?;

        let mut inner = StateInner {
            caches: persisted.caches,
            last_sequence: persisted.last_sequences,
            aliases: persisted.aliases,
            ..StateInner::default()
        };
        for op in persisted.operations {
            inner.next_seq = inner.next_seq.max(op.seq + 1);
            inner.log.insert(op.seq, op);
        }
        inner.next_seq = inner.next_seq.max(1);

        let pending = inner.log.len();
        if pending > 0 {
            info!(pending, "Restored pending operations");
        }
        let (pending_tx, _) = watch::channel(pending);

        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
            store,
            event_bus,
            pending_tx,
        }))
    }

    pub async fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            inner: self.inner.lock().await,
            store: &self.store,
            event_bus: &self.event_bus,
            pending_tx: &self.pending_tx,
        }
    }

    pub fn pending_count(&self) -> usize {
        *self.pending_tx.borrow()
    }

    pub fn pending_watch(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub async fn snapshot(&self, table: &TableRef) -> Option<CacheEntry> {
        self.inner.lock().await.caches.get(table).cloned()
    }

    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.inner.lock().await.log.values().cloned().collect()
    }

    /// Apply a feed change, deferring it if a local operation is pending.
    pub async fn apply_remote_change(&self, change: RemoteChange) -> Result<ApplyOutcome> {
        self.lock().await.apply_remote_change(change).await
    }

    /// Re-check changes deferred for `table`. Returns how many were applied.
    pub async fn replay_deferred(&self, table: &TableRef) -> Result<usize> {
        let mut guard = self.lock().await;
        let deferred = guard.inner.deferred.remove(table).unwrap_or_default();
        if deferred.is_empty() {
            return Ok(0);
        }

        let mut applied = 0;
        for change in deferred {
            if guard.apply_remote_change(change).await? == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        debug!(table = %table, applied, "Replayed deferred remote changes");
        Ok(applied)
    }
}

/// Exclusive access to the shared state.
pub struct StateGuard<'a> {
    inner: MutexGuard<'a, StateInner>,
    store: &'a SyncStore,
    event_bus: &'a EventBus,
    pending_tx: &'a watch::Sender<usize>,
}

impl StateGuard<'_> {
    // ------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------

    pub fn cache_entry(&self, table: &TableRef) -> Option<&CacheEntry> {
        self.inner.caches.get(table)
    }

    pub fn record(&self, table: &TableRef, record_id: &str) -> Option<&Record> {
        self.inner
            .caches
            .get(table)
            .and_then(|entry| entry.records.get(record_id))
    }

    pub async fn put_record(&mut self, table: &TableRef, record: Record) -> Result<()> {
        self.store.put_record(table, &record).await?;
        self.inner
            .caches
            .entry(table.clone())
            .or_insert_with(|| CacheEntry::new(table.clone()))
            .records
            .insert(record.id.clone(), record);
        Ok(())
    }

    pub async fn remove_record(&mut self, table: &TableRef, record_id: &str) -> Result<Option<Record>> {
        let removed = self
            .inner
            .caches
            .get_mut(table)
            .and_then(|entry| entry.records.remove(record_id));
        if removed.is_some() {
            self.store.delete_record(table, record_id).await?;
        }
        Ok(removed)
    }

    /// Replace a table snapshot with `records` fetched from the server.
    ///
    /// Records targeted by pending operations keep their local state.
    pub async fn replace_table(
        &mut self,
        table: &TableRef,
        records: Vec<Record>,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let pinned: Vec<String> = self
            .operations_for(table)
            .filter_map(|op| op.record_id().map(str::to_string))
            .collect();

        let previous = self
            .inner
            .caches
            .remove(table)
            .unwrap_or_else(|| CacheEntry::new(table.clone()));
        let mut entry = CacheEntry::new(table.clone());

        for record in records {
            if !pinned.contains(&record.id) {
                entry.records.insert(record.id.clone(), record);
            }
        }
        for id in &pinned {
            if let Some(local) = previous.records.get(id) {
                entry.records.insert(id.clone(), local.clone());
            }
        }
        entry.last_synced_at = Some(synced_at);

        self.store.clear_table(table).await?;
        for record in entry.records.values() {
            self.store.put_record(table, record).await?;
        }
        self.inner.caches.insert(table.clone(), entry);
        self.persist_meta(table).await
    }

    /// Drop a table's cache entry. Fails while operations reference it.
    pub async fn clear_table(&mut self, table: &TableRef) -> Result<bool> {
        let pending = self.operations_for(table).count();
        if pending > 0 {
            return Err(SyncError::TableBusy {
                table: table.to_string(),
                pending,
            });
        }
        self.inner.deferred.remove(table);
        self.inner.last_sequence.remove(table);
        let aliases: Vec<String> = self
            .inner
            .aliases
            .iter()
            .filter(|(_, alias)| &alias.table == table)
            .map(|(temp_id, _)| temp_id.clone())
            .collect();
        self.remove_aliases(&aliases).await?;
        let existed = self.inner.caches.remove(table).is_some();
        self.store.clear_table(table).await?;
        Ok(existed)
    }

    pub async fn mark_stale(&mut self, table: &TableRef) -> Result<()> {
        self.inner
            .caches
            .entry(table.clone())
            .or_insert_with(|| CacheEntry::new(table.clone()))
            .stale = true;
        self.persist_meta(table).await
    }

    pub fn cached_tables(&self) -> Vec<TableRef> {
        self.inner.caches.keys().cloned().collect()
    }

    async fn persist_meta(&mut self, table: &TableRef) -> Result<()> {
        let entry = self.inner.caches.get(table);
        let meta = TableMeta {
            last_synced_at: entry.and_then(|e| e.last_synced_at),
            stale: entry.map(|e| e.stale).unwrap_or(false),
            last_sequence: self.inner.last_sequence.get(table).copied(),
        };
        self.store.put_meta(table, &meta).await
    }

    // ------------------------------------------------------------------
    // Operation log
    // ------------------------------------------------------------------

    pub fn pending_len(&self) -> usize {
        self.inner.log.len()
    }

    /// Pending operations of `table` in log order.
    pub fn operations_for<'s>(
        &'s self,
        table: &'s TableRef,
    ) -> impl Iterator<Item = &'s PendingOperation> + 's {
        self.inner.log.values().filter(move |op| &op.table == table)
    }

    pub fn head_operation(&self, table: &TableRef) -> Option<PendingOperation> {
        self.operations_for(table).next().cloned()
    }

    pub fn tables_with_pending(&self) -> Vec<TableRef> {
        let mut tables: Vec<TableRef> = Vec::new();
        for op in self.inner.log.values() {
            if !tables.contains(&op.table) {
                tables.push(op.table.clone());
            }
        }
        tables
    }

    pub fn has_pending_for(&self, table: &TableRef, record_id: &str) -> bool {
        self.operations_for(table).any(|op| op.targets(record_id))
    }

    /// Whether a Create for `temp_id` is still queued.
    pub fn has_pending_create(&self, temp_id: &str) -> bool {
        self.inner
            .log
            .values()
            .any(|op| op.kind == OperationKind::Create && op.targets(temp_id))
    }

    /// Append to the log, assigning the next sequence.
    pub async fn append_operation(&mut self, mut op: PendingOperation) -> Result<PendingOperation> {
        op.seq = self.inner.next_seq;
        self.store.put_operation(&op).await?;
        self.inner.next_seq += 1;
        self.inner.log.insert(op.seq, op.clone());
        self.publish_pending();
        Ok(op)
    }

    pub async fn update_operation(&mut self, op: &PendingOperation) -> Result<()> {
        self.store.put_operation(op).await?;
        self.inner.log.insert(op.seq, op.clone());
        Ok(())
    }

    pub async fn remove_operation(&mut self, seq: u64) -> Result<Option<PendingOperation>> {
        let removed = self.inner.log.remove(&seq);
        if removed.is_some() {
            self.store.delete_operation(seq).await?;
            self.publish_pending();
        }
        Ok(removed)
    }

    fn publish_pending(&self) {
        let len = self.inner.log.len();
        self.pending_tx.send_if_modified(|count| {
            if *count == len {
                false
            } else {
                *count = len;
                true
            }
        });
    }

    // ------------------------------------------------------------------
    // Id remapping
    // ------------------------------------------------------------------

    /// Follow temp-id aliases to the current id.
    pub fn resolve_id(&self, record_id: &str) -> String {
        let mut current = record_id;
        // Aliases never chain in practice; the bound guards against cycles
        for _ in 0..8 {
            match self.inner.aliases.get(current) {
                Some(alias) => current = &alias.server_id,
                None => break,
            }
        }
        current.to_string()
    }

    /// Point every later operation on `temp_id` at `server_id` and record
    /// the alias.
    pub async fn remap_operations(
        &mut self,
        table: &TableRef,
        temp_id: &str,
        server_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let affected: Vec<u64> = self
            .inner
            .log
            .values()
            .filter(|op| op.target_id.as_deref() == Some(temp_id))
            .map(|op| op.seq)
            .collect();

        for seq in &affected {
            if let Some(op) = self.inner.log.get_mut(seq) {
                op.target_id = Some(server_id.to_string());
                let op = op.clone();
                self.store.put_operation(&op).await?;
            }
        }

        let alias = IdAlias {
            table: table.clone(),
            server_id: server_id.to_string(),
            created_at: now,
        };
        self.store.put_alias(temp_id, &alias).await?;
        self.inner.aliases.insert(temp_id.to_string(), alias);
        Ok(affected.len())
    }

    /// Forget aliases of `table` created before `cutoff` that no pending
    /// operation still targets.
    pub async fn prune_aliases(&mut self, table: &TableRef, cutoff: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<String> = self
            .inner
            .aliases
            .iter()
            .filter(|(_, alias)| &alias.table == table && alias.created_at < cutoff)
            .map(|(temp_id, _)| temp_id.clone())
            .filter(|temp_id| {
                !self
                    .inner
                    .log
                    .values()
                    .any(|op| op.target_id.as_deref() == Some(temp_id.as_str()))
            })
            .collect();
        self.remove_aliases(&expired).await?;
        if !expired.is_empty() {
            debug!(table = %table, pruned = expired.len(), "Pruned id aliases");
        }
        Ok(expired.len())
    }

    async fn remove_aliases(&mut self, temp_ids: &[String]) -> Result<()> {
        for temp_id in temp_ids {
            self.store.delete_alias(temp_id).await?;
            self.inner.aliases.remove(temp_id);
        }
        Ok(())
    }

    pub fn alias_count(&self) -> usize {
        self.inner.aliases.len()
    }

    // ------------------------------------------------------------------
    // Feed bookkeeping
    // ------------------------------------------------------------------

    pub fn last_sequence(&self, table: &TableRef) -> Option<u64> {
        self.inner.last_sequence.get(table).copied()
    }

    /// Record `sequence` as applied; false when it is not newer than the
    /// last one seen for the table.
    pub async fn accept_sequence(&mut self, table: &TableRef, sequence: u64) -> Result<bool> {
        if let Some(last) = self.inner.last_sequence.get(table) {
            if sequence <= *last {
                return Ok(false);
            }
        }
        self.inner.last_sequence.insert(table.clone(), sequence);
        self.persist_meta(table).await?;
        Ok(true)
    }

    pub fn deferred_len(&self, table: &TableRef) -> usize {
        self.inner.deferred.get(table).map_or(0, Vec::len)
    }

    pub async fn apply_remote_change(&mut self, change: RemoteChange) -> Result<ApplyOutcome> {
        let table = change.table.clone();
        let record_id = change.record_id().to_string();

        if self.has_pending_for(&table, &record_id) {
            debug!(table = %table, record_id = %record_id, "Deferring remote change behind local operation");
            self.inner
                .deferred
                .entry(table)
                .or_default()
                .push(change);
            return Ok(ApplyOutcome::Deferred);
        }

        match change.kind {
            RemoteChangeKind::Upsert(record) => {
                let existing = self.record(&table, &record_id).cloned();
                if let Some(existing) = &existing {
                    if existing.is_newer_than(&record) {
                        debug!(table = %table, record_id = %record_id, "Discarding stale remote change");
                        return Ok(ApplyOutcome::Stale);
                    }
                }
                self.put_record(&table, record).await?;

                let event = if existing.is_some() {
                    RecordEvent::Updated {
                        table: table.to_string(),
                        record_id,
                        source: ChangeSource::Remote,
                    }
                } else {
                    RecordEvent::Created {
                        table: table.to_string(),
                        record_id,
                        source: ChangeSource::Remote,
                    }
                };
                self.emit(CoreEvent::Record(event));
            }
            RemoteChangeKind::Delete { .. } => {
                if self.remove_record(&table, &record_id).await?.is_some() {
                    self.emit(CoreEvent::Record(RecordEvent::Deleted {
                        table: table.to_string(),
                        record_id,
                        source: ChangeSource::Remote,
                    }));
                }
            }
        }

        Ok(ApplyOutcome::Applied)
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.event_bus.emit(event);
    }
}
