//! Local Persistence Abstraction
//!
//! A deliberately small key-value contract. Values are opaque UTF-8 strings
//! (the sync engine stores JSON documents); keys are namespaced by the caller.

use async_trait::async_trait;

use crate::error::Result;

/// Durable key-value store used for the record cache and the
/// pending-operation log.
///
/// Implementations:
/// - Desktop: SQLite (`bridge-desktop::SqliteLocalStore`)
/// - Tests / ephemeral sessions: in-memory (`bridge-desktop::MemoryLocalStore`)
/// - Mobile / Web: host-provided (Room, Core Data, IndexedDB, ...)
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::LocalStore;
///
/// async fn remember(store: &dyn LocalStore) -> Result<()> {
///     store.set("app:last_table", "tblTasks").await?;
///     let keys = store.list_keys("app:").await?;
///     assert_eq!(keys, vec!["app:last_table".to_string()]);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Retrieve a value
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every key starting with `prefix`, in ascending lexicographic order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        for key in self.list_keys(prefix).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}
