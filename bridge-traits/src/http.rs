//! HTTP Client Abstraction
//!
//! Provides single-attempt async HTTP operations. Retry, credential
//! injection and outcome classification belong to the transport layer
//! built on top of this trait.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// HTTP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.header("Authorization", format!("Bearer {}", token.into()))
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let json = serde_json::to_vec(body).map_err(|e| {
            BridgeError::OperationFailed(format!("JSON serialization failed: {}", e))
        })?;
        self.body = Some(Bytes::from(json));
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        Ok(self)
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Parse response body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            BridgeError::OperationFailed(format!("JSON deserialization failed: {}", e))
        })
    }

    /// Get response body as UTF-8 string
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid UTF-8: {}", e)))
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response status indicates a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if response status indicates a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Upload progress callback, invoked with `(bytes_sent, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A single file part of a multipart/form-data upload.
#[derive(Debug, Clone)]
pub struct MultipartFile {
    /// Form field name the file is attached under
    pub field_name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl MultipartFile {
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Retry policy configuration
///
/// Delays follow `min(max_delay, base_delay * 2^(attempt-1))` plus up to
/// `jitter_ratio` of that value drawn uniformly at random.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay between retries (before jitter)
    pub max_delay: Duration,
    /// Whether to use exponential backoff
    pub use_exponential_backoff: bool,
    /// Upper bound of the random jitter as a fraction of the delay
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            use_exponential_backoff: true,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.base_delay.min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        let max_jitter = delay.as_secs_f64() * self.jitter_ratio.max(0.0);
        if max_jitter <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..max_jitter);
        delay + Duration::from_secs_f64(jitter)
    }
}

/// Async HTTP client trait
///
/// This trait abstracts HTTP operations to allow platform-specific implementations.
/// Implementations perform exactly one attempt per call and report failures
/// that happened before a response was received as [`BridgeError::Network`]
/// or [`BridgeError::Timeout`]. Any received response, including 4xx/5xx,
/// is returned as `Ok`.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest, HttpMethod};
///
/// async fn fetch_data(client: &dyn HttpClient) -> Result<String> {
///     let request = HttpRequest::new(HttpMethod::Get, "https://api.example.com/data")
///         .bearer_token("token");
///
///     let response = client.execute(request).await?;
///     response.text()
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute an HTTP request
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Network connection fails
    /// - TLS validation fails
    /// - Request times out
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Send `file` as a multipart/form-data body.
    ///
    /// `progress` is invoked as chunks of the body are handed to the network.
    async fn upload_multipart(
        &self,
        request: HttpRequest,
        file: MultipartFile,
        progress: Option<ProgressCallback>,
    ) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_builder() {
        let request = HttpRequest::new(HttpMethod::Get, "https://example.com")
            .header("User-Agent", "test")
            .bearer_token("secret")
            .timeout(Duration::from_secs(30));

        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.headers.get("User-Agent"), Some(&"test".to_string()));
        assert_eq!(
            request.headers.get("Authorization"),
            Some(&"Bearer secret".to_string())
        );
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_http_request_json_body() {
        let request = HttpRequest::new(HttpMethod::Post, "https://example.com")
            .json(&serde_json::json!({"fields": {"Name": "A"}}))
            .unwrap();

        assert_eq!(
            request.headers.get("Content-Type"),
            Some(&"application/json".to_string())
        );
        let body: serde_json::Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["fields"]["Name"], "A");
    }

    #[test]
    fn test_http_response_status_checks() {
        let response = HttpResponse::new(200, "test");

        assert!(response.is_success());
        assert!(!response.is_client_error());
        assert!(!response.is_server_error());

        let response = HttpResponse::new(503, "");
        assert!(response.is_server_error());
    }

    #[test]
    fn test_http_response_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(429, "").with_header("Retry-After", "3");

        assert_eq!(response.header("retry-after"), Some("3"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn test_retry_policy_exponential_delays_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            use_exponential_backoff: true,
            jitter_ratio: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_retry_policy_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();

        for attempt in 1..=6 {
            let base = policy.base_delay_for_attempt(attempt);
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(0.1));
        }
    }

    #[test]
    fn test_retry_policy_linear_mode() {
        let policy = RetryPolicy {
            use_exponential_backoff: false,
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for_attempt(5), policy.base_delay);
    }
}
