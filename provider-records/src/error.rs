//! Error taxonomy for the remote record API

use bridge_traits::error::BridgeError;
use bridge_traits::http::HttpResponse;
use core_auth::AuthError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Classified outcome of a failed request.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// No response was received (connect failure, reset, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// 401 that survived one credential refresh
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The credential source could not produce a token
    #[error("Credential unavailable: {0}")]
    Credential(String),

    /// 400 or 422
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        /// Field name to problem description
        fields: BTreeMap<String, String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<Duration> },

    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Unexpected response (status {status}): {message}")]
    Unexpected { status: u16, message: String },

    #[error("Failed to parse API response: {0}")]
    Decode(String),

    #[error("Bridge error: {0}")]
    Bridge(String),
}

/// Result type for record API operations
pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Classify a non-2xx response.
    pub fn from_response(response: &HttpResponse) -> Self {
        let (message, fields) = parse_error_body(response);
        match response.status {
            400 | 422 => ApiError::Validation { message, fields },
            401 => ApiError::Authentication(message),
            403 => ApiError::Permission(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            429 => ApiError::RateLimit {
                retry_after: response
                    .header("Retry-After")
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map(Duration::from_secs),
            },
            status @ 500..=599 => ApiError::Server { status, message },
            status => ApiError::Unexpected { status, message },
        }
    }

    /// Whether the transport retries this outcome within one logical request.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::RateLimit { .. } => true,
            ApiError::Server { status, .. } => matches!(status, 502 | 503 | 504),
            _ => false,
        }
    }

    /// Whether a later drain pass may still succeed.
    ///
    /// Wider than [`is_retryable`](Self::is_retryable): any 5xx and
    /// credential problems leave the operation queued.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_)
                | ApiError::RateLimit { .. }
                | ApiError::Server { .. }
                | ApiError::Authentication(_)
                | ApiError::Credential(_)
        )
    }

    /// Network-class failures flip the connection state to Offline.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// HTTP status that produced this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Authentication(_) => Some(401),
            ApiError::Validation { .. } => Some(400),
            ApiError::NotFound(_) => Some(404),
            ApiError::Permission(_) => Some(403),
            ApiError::Conflict(_) => Some(409),
            ApiError::RateLimit { .. } => Some(429),
            ApiError::Server { status, .. } | ApiError::Unexpected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(error: BridgeError) -> Self {
        if error.is_network() {
            ApiError::Network(error.to_string())
        } else {
            ApiError::Bridge(error.to_string())
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        ApiError::Credential(error.to_string())
    }
}

/// Pull a message and per-field details out of an error body.
///
/// Accepts `{"error": {"type", "message", "fields"}}`, `{"error": "CODE"}`
/// and plain text.
fn parse_error_body(response: &HttpResponse) -> (String, BTreeMap<String, String>) {
    let mut fields = BTreeMap::new();

    let Ok(body) = serde_json::from_slice::<Value>(&response.body) else {
        let text = String::from_utf8_lossy(&response.body).trim().to_string();
        let message = if text.is_empty() {
            format!("HTTP {}", response.status)
        } else {
            text
        };
        return (message, fields);
    };

    let error = body.get("error").unwrap_or(&body);
    let message = match error {
        Value::String(code) => code.clone(),
        Value::Object(map) => {
            if let Some(Value::Object(details)) = map.get("fields") {
                for (name, detail) in details {
                    let detail = match detail {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    fields.insert(name.clone(), detail);
                }
            }
            let kind = map.get("type").and_then(Value::as_str);
            let text = map.get("message").and_then(Value::as_str);
            match (kind, text) {
                (Some(kind), Some(text)) => format!("{}: {}", kind, text),
                (None, Some(text)) => text.to_string(),
                (Some(kind), None) => kind.to_string(),
                (None, None) => format!("HTTP {}", response.status),
            }
        }
        _ => format!("HTTP {}", response.status),
    };

    (message, fields)
}
