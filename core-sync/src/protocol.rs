//! Push feed wire format.
//!
//! Inbound: `{"type", "tableRef", "payload", "sequence"}` where `type` is one
//! of `record.created`, `record.updated`, `record.deleted`, `table.updated`
//! or `base.updated`. Outbound: `{"type": "subscribe" | "unsubscribe",
//! "baseId", "tableId"}`.

use provider_records::{Record, TableRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::state::{RemoteChange, RemoteChangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FeedEventType {
    #[serde(rename = "record.created")]
    RecordCreated,
    #[serde(rename = "record.updated")]
    RecordUpdated,
    #[serde(rename = "record.deleted")]
    RecordDeleted,
    #[serde(rename = "table.updated")]
    TableUpdated,
    #[serde(rename = "base.updated")]
    BaseUpdated,
    #[serde(other)]
    Unknown,
}

/// `tableRef` of an inbound message; `tableId` is absent for base events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedTableRef {
    pub base_id: String,
    #[serde(default)]
    pub table_id: Option<String>,
}

impl FeedTableRef {
    pub fn table(&self) -> Option<TableRef> {
        self.table_id
            .as_ref()
            .map(|table_id| TableRef::new(self.base_id.clone(), table_id.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedMessage {
    #[serde(rename = "type")]
    pub event_type: FeedEventType,
    pub table_ref: FeedTableRef,
    #[serde(default)]
    pub payload: Value,
    pub sequence: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordPayload {
    record: Option<Record>,
    record_id: Option<String>,
}

impl FeedMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::Feed(format!("malformed message: {}", e)))
    }

    /// Convert a record event into a cache change. `None` for schema and
    /// unknown events.
    pub fn to_change(&self) -> Result<Option<RemoteChange>> {
        let Some(table) = self.table_ref.table() else {
            return Ok(None);
        };

        let kind = match self.event_type {
            FeedEventType::RecordCreated | FeedEventType::RecordUpdated => {
                let payload: RecordPayload = serde_json::from_value(self.payload.clone())
                    .map_err(|e| SyncError::Feed(format!("malformed record payload: {}", e)))?;
                let record = payload
                    .record
                    .ok_or_else(|| SyncError::Feed("record event without record".to_string()))?;
                RemoteChangeKind::Upsert(record)
            }
            FeedEventType::RecordDeleted => {
                let payload: RecordPayload = serde_json::from_value(self.payload.clone())
                    .map_err(|e| SyncError::Feed(format!("malformed delete payload: {}", e)))?;
                let record_id = payload
                    .record_id
                    .or_else(|| payload.record.map(|r| r.id))
                    .ok_or_else(|| SyncError::Feed("delete event without recordId".to_string()))?;
                RemoteChangeKind::Delete { record_id }
            }
            _ => return Ok(None),
        };

        Ok(Some(RemoteChange {
            table,
            sequence: self.sequence,
            kind,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe {
        #[serde(flatten)]
        table: TableRef,
    },
    Unsubscribe {
        #[serde(flatten)]
        table: TableRef,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
