use core_sync::SyncError;
use provider_records::ApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The operation needs the network and cannot be queued.
    #[error("Offline: {0}")]
    Offline(String),

    #[error("Sync error: {0}")]
    Sync(SyncError),

    #[error(transparent)]
    Api(ApiError),

    #[error("Authentication error: {0}")]
    Auth(#[from] core_auth::AuthError),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Record {record_id} has not been synced yet")]
    NotSynced { record_id: String },

    #[error("Real-time feed is disabled")]
    FeedDisabled,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Client has been destroyed")]
    Destroyed,
}

impl ClientError {
    /// Whether retrying later, once connectivity returns, may succeed.
    pub fn is_offline(&self) -> bool {
        matches!(self, ClientError::Offline(_))
    }
}

impl From<ApiError> for ClientError {
    fn from(error: ApiError) -> Self {
        if error.is_network() {
            ClientError::Offline(error.to_string())
        } else {
            ClientError::Api(error)
        }
    }
}

impl From<SyncError> for ClientError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::QueueFull { limit } => ClientError::Offline(format!(
                "{} operations are waiting for connectivity",
                limit
            )),
            SyncError::Api(api) => api.into(),
            SyncError::Cancelled => ClientError::Cancelled,
            other => ClientError::Sync(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_is_offline() {
        let error: ClientError = SyncError::QueueFull { limit: 3 }.into();
        assert!(error.is_offline());
    }

    #[test]
    fn test_network_api_error_is_offline() {
        let error: ClientError = ApiError::Network("unreachable".to_string()).into();
        assert!(error.is_offline());

        let error: ClientError = SyncError::Api(ApiError::NotFound("rec1".to_string())).into();
        assert!(matches!(error, ClientError::Api(ApiError::NotFound(_))));
    }
}
