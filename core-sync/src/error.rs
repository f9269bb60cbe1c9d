use bridge_traits::error::BridgeError;
use provider_records::ApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid table reference: {0}")]
    InvalidTable(String),

    #[error("A record id is required for {operation}")]
    MissingRecordId { operation: String },

    #[error("Record {record_id} is unknown in {table}")]
    UnknownRecord { table: String, record_id: String },

    #[error("Pending operation log is full ({limit} operations)")]
    QueueFull { limit: usize },

    #[error("Cannot clear {table}: {pending} pending operations reference it")]
    TableBusy { table: String, pending: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt persisted entry {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Sync cancelled")]
    Cancelled,
}

impl From<BridgeError> for SyncError {
    fn from(error: BridgeError) -> Self {
        SyncError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
