use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("Operation timed out: {operation}")]
    OperationTimeout { operation: String },
}

impl AuthError {
    pub(crate) fn from_bridge(error: BridgeError, refreshing: bool) -> Self {
        if refreshing {
            AuthError::TokenRefreshFailed(error.to_string())
        } else {
            AuthError::CredentialUnavailable(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
