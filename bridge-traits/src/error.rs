use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Network unreachable: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure happened below HTTP, i.e. no response was received.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            BridgeError::Network(_) | BridgeError::Timeout(_) | BridgeError::ConnectionClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
