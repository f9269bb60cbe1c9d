//! # Persistence Layout
//!
//! Maps the queue's state onto the host's [`LocalStore`].
//!
//! ## Key layout
//!
//! ```text
//! {ns}:oplog:{seq:020}                 PendingOperation (JSON)
//! {ns}:cache:{base}:{table}:{record}   Record (JSON)
//! {ns}:meta:{base}:{table}             TableMeta (JSON)
//! {ns}:alias:{temp_id}                 IdAlias (JSON)
//! ```
//!
//! Key components, the namespace included, are percent-encoded so values
//! containing `:` cannot collide.
//! The zero-padded sequence keeps the operation log in order under a plain
//! lexicographic key listing.

use bridge_traits::LocalStore;
use provider_records::{Record, TableRef};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{CacheEntry, IdAlias, OperationStatus, PendingOperation, TableMeta};

/// Everything read back from the store on startup.
#[derive(Debug, Default)]
pub struct PersistedState {
    pub operations: Vec<PendingOperation>,
    pub caches: HashMap<TableRef, CacheEntry>,
    pub last_sequences: HashMap<TableRef, u64>,
    pub aliases: HashMap<String, IdAlias>,
}

/// Namespaced view of a [`LocalStore`].
#[derive(Clone)]
pub struct SyncStore {
    store: Arc<dyn LocalStore>,
    namespace: String,
}

fn enc(component: &str) -> String {
    urlencoding::encode(component).into_owned()
}

fn dec(component: &str) -> Option<String> {
    urlencoding::decode(component).ok().map(|s| s.into_owned())
}

impl SyncStore {
    pub fn new(store: Arc<dyn LocalStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn oplog_prefix(&self) -> String {
        format!("{}:oplog:", enc(&self.namespace))
    }

    fn oplog_key(&self, seq: u64) -> String {
        format!("{}{:020}", self.oplog_prefix(), seq)
    }

    fn cache_prefix(&self) -> String {
        format!("{}:cache:", enc(&self.namespace))
    }

    fn table_cache_prefix(&self, table: &TableRef) -> String {
        format!(
            "{}{}:{}:",
            self.cache_prefix(),
            enc(&table.base_id),
            enc(&table.table_id)
        )
    }

    fn cache_key(&self, table: &TableRef, record_id: &str) -> String {
        format!("{}{}", self.table_cache_prefix(table), enc(record_id))
    }

    fn meta_prefix(&self) -> String {
        format!("{}:meta:", enc(&self.namespace))
    }

    fn meta_key(&self, table: &TableRef) -> String {
        format!(
            "{}{}:{}",
            self.meta_prefix(),
            enc(&table.base_id),
            enc(&table.table_id)
        )
    }

    fn alias_prefix(&self) -> String {
        format!("{}:alias:", enc(&self.namespace))
    }

    pub async fn put_operation(&self, op: &PendingOperation) -> Result<()> {
        let value = serde_json::to_string(op)?;
        self.store.set(&self.oplog_key(op.seq), &value).await?;
        Ok(())
    }

    pub async fn delete_operation(&self, seq: u64) -> Result<()> {
        self.store.delete(&self.oplog_key(seq)).await?;
        Ok(())
    }

    pub async fn put_record(&self, table: &TableRef, record: &Record) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.store
            .set(&self.cache_key(table, &record.id), &value)
            .await?;
        Ok(())
    }

    pub async fn delete_record(&self, table: &TableRef, record_id: &str) -> Result<()> {
        self.store.delete(&self.cache_key(table, record_id)).await?;
        Ok(())
    }

    pub async fn put_meta(&self, table: &TableRef, meta: &TableMeta) -> Result<()> {
        let value = serde_json::to_string(meta)?;
        self.store.set(&self.meta_key(table), &value).await?;
        Ok(())
    }

    fn alias_key(&self, temp_id: &str) -> String {
        format!("{}{}", self.alias_prefix(), enc(temp_id))
    }

    pub async fn put_alias(&self, temp_id: &str, alias: &IdAlias) -> Result<()> {
        let value = serde_json::to_string(alias)?;
        self.store.set(&self.alias_key(temp_id), &value).await?;
        Ok(())
    }

    pub async fn delete_alias(&self, temp_id: &str) -> Result<()> {
        self.store.delete(&self.alias_key(temp_id)).await?;
        Ok(())
    }

    /// Remove a table's cached records and metadata.
    pub async fn clear_table(&self, table: &TableRef) -> Result<()> {
        self.store
            .delete_prefix(&self.table_cache_prefix(table))
            .await?;
        self.store.delete(&self.meta_key(table)).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping corrupt persisted entry");
                Ok(None)
            }
        }
    }

    /// Read back the whole namespace.
    ///
    /// Operations persisted as `InFlight` come back `Queued`: their outcome
    /// is unknown, so they are delivered again. Corrupt entries are skipped
    /// with a warning.
    pub async fn load(&self) -> Result<PersistedState> {
        let mut state = PersistedState::default();

        for key in self.store.list_keys(&self.oplog_prefix()).await? {
            if let Some(mut op) = self.read_json::<PendingOperation>(&key).await? {
                if op.status == OperationStatus::InFlight {
                    debug!(op_id = %op.op_id, "Restoring in-flight operation as queued");
                    op.status = OperationStatus::Queued;
                }
                state.operations.push(op);
            }
        }
        state.operations.sort_by_key(|op| op.seq);

        let cache_prefix = self.cache_prefix();
        for key in self.store.list_keys(&cache_prefix).await? {
            let parts: Vec<&str> = key[cache_prefix.len()..].split(':').collect();
            let [base, table, _record] = parts.as_slice() else {
                warn!(key = %key, "Skipping cache key with unexpected layout");
                continue;
            };
            let (Some(base), Some(table)) = (dec(base), dec(table)) else {
                continue;
            };
            let table = TableRef::new(base, table);
            if let Some(record) = self.read_json::<Record>(&key).await? {
                state
                    .caches
                    .entry(table.clone())
                    .or_insert_with(|| CacheEntry::new(table))
                    .records
                    .insert(record.id.clone(), record);
            }
        }

        let meta_prefix = self.meta_prefix();
        for key in self.store.list_keys(&meta_prefix).await? {
            let parts: Vec<&str> = key[meta_prefix.len()..].split(':').collect();
            let [base, table] = parts.as_slice() else {
                continue;
            };
            let (Some(base), Some(table)) = (dec(base), dec(table)) else {
                continue;
            };
            let table = TableRef::new(base, table);
            if let Some(meta) = self.read_json::<TableMeta>(&key).await? {
                if let Some(sequence) = meta.last_sequence {
                    state.last_sequences.insert(table.clone(), sequence);
                }
                let entry = state
                    .caches
                    .entry(table.clone())
                    .or_insert_with(|| CacheEntry::new(table));
                entry.last_synced_at = meta.last_synced_at;
                entry.stale = meta.stale;
            }
        }

        let alias_prefix = self.alias_prefix();
        for key in self.store.list_keys(&alias_prefix).await? {
            let Some(temp_id) = dec(&key[alias_prefix.len()..]) else {
                continue;
            };
            if let Some(alias) = self.read_json::<IdAlias>(&key).await? {
                state.aliases.insert(temp_id, alias);
            }
        }

        debug!(
            operations = state.operations.len(),
            tables = state.caches.len(),
            "Loaded persisted sync state"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::MemoryLocalStore;
    use chrono::Utc;
    use provider_records::Fields;
    use serde_json::json;

    fn table() -> TableRef {
        TableRef::new("app1", "Tasks:Open")
    }

    fn alias(server_id: &str) -> IdAlias {
        IdAlias {
            table: table(),
            server_id: server_id.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_operations_load_in_sequence_order() {
        let store = SyncStore::new(Arc::new(MemoryLocalStore::new()), "ns");

        for seq in [10u64, 2, 7] {
            let mut op = PendingOperation::delete(table(), format!("rec{}", seq), Utc::now());
            op.seq = seq;
            store.put_operation(&op).await.unwrap();
        }

        let loaded = store.load().await.unwrap();
        let seqs: Vec<u64> = loaded.operations.iter().map(|op| op.seq).collect();
        assert_eq!(seqs, vec![2, 7, 10]);
    }

    #[tokio::test]
    async fn test_in_flight_restores_as_queued() {
        let store = SyncStore::new(Arc::new(MemoryLocalStore::new()), "ns");
        let mut op = PendingOperation::delete(table(), "rec1".to_string(), Utc::now());
        op.seq = 1;
        op.status = OperationStatus::InFlight;
        store.put_operation(&op).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.operations[0].status, OperationStatus::Queued);
    }

    #[tokio::test]
    async fn test_cache_keys_survive_separators_in_ids() {
        let store = SyncStore::new(Arc::new(MemoryLocalStore::new()), "ns");
        let mut fields = Fields::new();
        fields.insert("Name".to_string(), json!("A"));
        let record = Record::new("rec:1", fields, Utc::now());

        store.put_record(&table(), &record).await.unwrap();
        store
            .put_meta(
                &table(),
                &TableMeta {
                    last_synced_at: None,
                    stale: true,
                    last_sequence: Some(42),
                },
            )
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        let entry = loaded.caches.get(&table()).unwrap();
        assert_eq!(entry.records.get("rec:1"), Some(&record));
        assert!(entry.stale);
        assert_eq!(loaded.last_sequences.get(&table()), Some(&42));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backing: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let first = SyncStore::new(backing.clone(), "first");
        let second = SyncStore::new(backing, "second");

        first.put_alias("tmp_1", &alias("rec1")).await.unwrap();

        assert_eq!(first.load().await.unwrap().aliases.len(), 1);
        assert!(second.load().await.unwrap().aliases.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_containing_separator_does_not_overlap() {
        let backing: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let outer = SyncStore::new(backing.clone(), "a");
        let inner = SyncStore::new(backing, "a:cache:x");

        let mut op = PendingOperation::delete(table(), "rec1".to_string(), Utc::now());
        op.seq = 1;
        inner.put_operation(&op).await.unwrap();
        inner
            .put_record(&table(), &Record::new("rec1", Fields::new(), Utc::now()))
            .await
            .unwrap();
        inner.put_alias("tmp_1", &alias("rec1")).await.unwrap();

        let loaded = outer.load().await.unwrap();
        assert!(loaded.operations.is_empty());
        assert!(loaded.caches.is_empty());
        assert!(loaded.aliases.is_empty());
        assert_eq!(inner.load().await.unwrap().operations.len(), 1);
    }

    #[tokio::test]
    async fn test_alias_round_trip_and_delete() {
        let store = SyncStore::new(Arc::new(MemoryLocalStore::new()), "ns");
        store.put_alias("tmp_1", &alias("rec1")).await.unwrap();
        assert_eq!(
            store.load().await.unwrap().aliases["tmp_1"].server_id,
            "rec1"
        );

        store.delete_alias("tmp_1").await.unwrap();
        assert!(store.load().await.unwrap().aliases.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_entries_are_skipped() {
        let backing = Arc::new(MemoryLocalStore::new());
        backing
            .set("ns:oplog:00000000000000000001", "{not json")
            .await
            .unwrap();
        let store = SyncStore::new(backing, "ns");

        assert!(store.load().await.unwrap().operations.is_empty());
    }

    #[tokio::test]
    async fn test_clear_table() {
        let store = SyncStore::new(Arc::new(MemoryLocalStore::new()), "ns");
        store
            .put_record(&table(), &Record::new("rec1", Fields::new(), Utc::now()))
            .await
            .unwrap();
        store.put_meta(&table(), &TableMeta::default()).await.unwrap();

        store.clear_table(&table()).await.unwrap();
        assert!(store.load().await.unwrap().caches.is_empty());
    }
}
