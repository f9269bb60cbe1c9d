//! In-memory Local Store

use async_trait::async_trait;
use bridge_traits::{error::Result, storage::LocalStore};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// [`LocalStore`] kept in a sorted map.
///
/// Nothing survives the process; useful for tests and for hosts that only
/// want the optimistic cache for the lifetime of a session.
#[derive(Default)]
pub struct MemoryLocalStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
