//! Local Store using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::LocalStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_store (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
"#;

/// SQLite-backed [`LocalStore`] implementation
///
/// One table of `(key, value)` rows. Prefix listing uses a range scan on the
/// primary key so it stays cheap with many cached records.
pub struct SqliteLocalStore {
    pool: SqlitePool,
}

impl SqliteLocalStore {
    /// Open (or create) the store at `db_path`
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        // SQLite URLs use forward slashes on every platform
        let path_str = db_path.to_string_lossy().replace('\\', "/");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| BridgeError::DatabaseError(format!("Invalid DB path: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to connect to DB: {}", e)))?;

        Self::initialize(&pool).await?;
        debug!(path = ?db_path, "Initialized local store");

        Ok(Self { pool })
    }

    /// Create an in-memory store (for testing)
    ///
    /// A single connection is used since every `:memory:` connection would
    /// otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to connect to DB: {}", e)))?;

        Self::initialize(&pool).await?;
        Ok(Self { pool })
    }

    async fn initialize(pool: &SqlitePool) -> Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to create table: {}", e)))?;
        Ok(())
    }

    /// Smallest string greater than every string starting with `prefix`.
    fn prefix_upper_bound(prefix: &str) -> Option<String> {
        let mut chars: Vec<char> = prefix.chars().collect();
        while let Some(last) = chars.pop() {
            if let Some(next) = char::from_u32(last as u32 + 1) {
                chars.push(next);
                return Some(chars.into_iter().collect());
            }
        }
        None
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to read key: {}", e)))?;

        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::DatabaseError(format!("Failed to write key: {}", e)))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to delete key: {}", e)))?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = match Self::prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query("SELECT key FROM kv_store WHERE key >= ? AND key < ? ORDER BY key")
                    .bind(prefix)
                    .bind(upper)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT key FROM kv_store ORDER BY key")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| BridgeError::DatabaseError(format!("Failed to list keys: {}", e)))?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let result = match Self::prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query("DELETE FROM kv_store WHERE key >= ? AND key < ?")
                    .bind(prefix)
                    .bind(upper)
                    .execute(&self.pool)
                    .await
            }
            None => sqlx::query("DELETE FROM kv_store").execute(&self.pool).await,
        }
        .map_err(|e| BridgeError::DatabaseError(format!("Failed to delete keys: {}", e)))?;

        debug!(prefix, removed = result.rows_affected(), "Deleted key range");
        Ok(())
    }
}
