//! # Pending Operations and Cache Entries
//!
//! Data model of the mutation queue.
//!
//! ## Operation lifecycle
//!
//! ```text
//! Queued → InFlight → (removed: applied or dropped)
//!            ↓   ↑
//!          Failed
//! ```
//!
//! `Failed` operations stay at the head of their table's log and are retried
//! on the next drain pass.

use chrono::{DateTime, Utc};
use provider_records::{Fields, Record, TableRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Prefix of client-assigned record ids awaiting Create resolution
pub const TEMP_ID_PREFIX: &str = "tmp_";

pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a pending operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::Serialization(format!("invalid operation id: {}", e)))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(SyncError::Serialization(format!(
                "unknown operation kind: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for a drain pass
    Queued,
    /// Sent to the remote API, outcome unknown
    InFlight,
    /// Last attempt failed transiently; eligible for the next pass
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::Serialization(format!(
                "unknown operation status: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Pending Operation
// ============================================================================

/// One user mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub op_id: OperationId,
    /// Position in the log; assigned on append
    pub seq: u64,
    pub kind: OperationKind,
    pub table: TableRef,
    /// Record the operation targets; `None` only for Create
    pub target_id: Option<String>,
    /// Temporary id a Create inserted into the cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub payload: Option<Fields>,
    pub created_at: DateTime<Utc>,
    pub attempt: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingOperation {
    pub fn create(table: TableRef, temp_id: String, fields: Fields, now: DateTime<Utc>) -> Self {
        Self::new(OperationKind::Create, table, None, Some(temp_id), Some(fields), now)
    }

    pub fn update(table: TableRef, record_id: String, fields: Fields, now: DateTime<Utc>) -> Self {
        Self::new(OperationKind::Update, table, Some(record_id), None, Some(fields), now)
    }

    pub fn delete(table: TableRef, record_id: String, now: DateTime<Utc>) -> Self {
        Self::new(OperationKind::Delete, table, Some(record_id), None, None, now)
    }

    fn new(
        kind: OperationKind,
        table: TableRef,
        target_id: Option<String>,
        temp_id: Option<String>,
        payload: Option<Fields>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            op_id: OperationId::new(),
            seq: 0,
            kind,
            table,
            target_id,
            temp_id,
            payload,
            created_at: now,
            attempt: 0,
            status: OperationStatus::Queued,
            last_error: None,
        }
    }

    /// The cached record this operation affects.
    pub fn record_id(&self) -> Option<&str> {
        match self.kind {
            OperationKind::Create => self.temp_id.as_deref(),
            _ => self.target_id.as_deref(),
        }
    }

    pub fn targets(&self, record_id: &str) -> bool {
        self.record_id() == Some(record_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now - self.created_at > max_age,
            Err(_) => false,
        }
    }
}

// ============================================================================
// Cache Entry
// ============================================================================

/// Cached snapshot of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub table: TableRef,
    pub records: HashMap<String, Record>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Set when the remote schema changed after the snapshot was taken
    pub stale: bool,
}

impl CacheEntry {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            records: HashMap::new(),
            last_synced_at: None,
            stale: false,
        }
    }

    /// Records ordered by creation time, then id.
    pub fn sorted_records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }
}

/// Persisted per-table metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMeta {
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stale: bool,
    /// Highest feed sequence applied
    #[serde(default)]
    pub last_sequence: Option<u64>,
}

/// Server id a confirmed temporary id now points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdAlias {
    pub table: TableRef,
    pub server_id: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Sync Result
// ============================================================================

pub use core_runtime::events::FailedOperation;

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub applied: Vec<OperationId>,
    pub failed: Vec<FailedOperation>,
    /// Operations still queued after the pass
    pub remaining: usize,
}

impl SyncResult {
    pub fn merge(&mut self, other: SyncResult) {
        self.applied.extend(other.applied);
        self.failed.extend(other.failed);
        self.remaining += other.remaining;
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.failed.is_empty() && self.remaining == 0
    }
}
