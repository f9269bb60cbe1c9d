//! # Client Configuration Module
//!
//! Provides configuration management for the sync client.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! [`SyncClientConfig`] holding every injected capability and tuning value.
//! It enforces fail-fast validation so a misconfigured client never starts.
//!
//! ## Required Dependencies
//!
//! - `CredentialSource` - bearer credential for the remote API
//! - `base_url` - root URL of the remote record API
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - HTTP operations (desktop default: reqwest)
//! - `LocalStore` - cache and operation log persistence (desktop default:
//!   SQLite when `database_path` is set, in-memory otherwise)
//! - `PushConnector` - real-time feed connection (desktop default: WebSocket)
//!
//! Without the `desktop-shims` feature, missing capabilities fail with
//! [`Error::CapabilityMissing`].
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::SyncClientConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = SyncClientConfig::builder()
//!     .credential_source(Arc::new(MyCredentials))
//!     .base_url("https://api.example.com")
//!     .request_timeout(Duration::from_secs(10))
//!     .enable_realtime_feed(false)
//!     .build()
//!     .expect("Failed to build config");
//! ```

use crate::error::{Error, Result};
use bridge_traits::{CredentialSource, HttpClient, LocalStore, PushConnector, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_PENDING_OPERATION_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_MAX_PENDING_OPERATIONS: usize = 10_000;
pub const DEFAULT_MAX_OPERATION_ATTEMPTS: u32 = 5;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_NAMESPACE: &str = "recordsync";

/// Configuration for one sync client instance.
///
/// Use [`SyncClientConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct SyncClientConfig {
    /// Supplies and refreshes the bearer credential (required)
    pub credential_source: Arc<dyn CredentialSource>,

    /// Root URL of the remote record API, without trailing slash
    pub base_url: String,

    /// URL of the real-time feed
    pub feed_url: String,

    pub http_client: Arc<dyn HttpClient>,

    pub local_store: Arc<dyn LocalStore>,

    /// Required when the real-time feed is enabled
    pub push_connector: Option<Arc<dyn PushConnector>>,

    /// Default timeout of one HTTP attempt
    pub request_timeout: Duration,

    /// Transport attempts per logical request, first attempt included
    pub max_retry_attempts: u32,

    pub retry_base_delay: Duration,

    pub retry_max_delay: Duration,

    /// When disabled, mutations go straight to the remote API
    pub enable_offline_queue: bool,

    pub enable_realtime_feed: bool,

    /// Queued operations older than this are dropped and reported
    pub max_pending_operation_age: Option<Duration>,

    /// New mutations are rejected once this many operations are pending
    pub max_pending_operations: usize,

    /// Drain attempts per operation before it is dropped
    pub max_operation_attempts: u32,

    /// Period of the background drain, `None` disables it
    pub sync_interval: Option<Duration>,

    /// Key prefix isolating this instance's persisted state
    pub namespace: String,

    pub event_buffer_size: usize,
}

impl std::fmt::Debug for SyncClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClientConfig")
            .field("credential_source", &"CredentialSource { ... }")
            .field("base_url", &self.base_url)
            .field("feed_url", &self.feed_url)
            .field("http_client", &"HttpClient { ... }")
            .field("local_store", &"LocalStore { ... }")
            .field(
                "push_connector",
                &self.push_connector.as_ref().map(|_| "PushConnector { ... }"),
            )
            .field("request_timeout", &self.request_timeout)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("enable_offline_queue", &self.enable_offline_queue)
            .field("enable_realtime_feed", &self.enable_realtime_feed)
            .field("max_pending_operation_age", &self.max_pending_operation_age)
            .field("max_pending_operations", &self.max_pending_operations)
            .field("max_operation_attempts", &self.max_operation_attempts)
            .field("sync_interval", &self.sync_interval)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl SyncClientConfig {
    pub fn builder() -> SyncClientConfigBuilder {
        SyncClientConfigBuilder::default()
    }

    /// Retry policy shared by the transport and feed reconnects.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            use_exponential_backoff: true,
            jitter_ratio: 0.1,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "Base URL must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }

        if !(self.feed_url.starts_with("ws://") || self.feed_url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "Feed URL must start with ws:// or wss://, got '{}'",
                self.feed_url
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than 0ms".to_string(),
            ));
        }

        if self.max_retry_attempts == 0 {
            return Err(Error::Config(
                "Max retry attempts must be at least 1 (the first attempt counts)".to_string(),
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::Config(
                "Retry base delay cannot exceed the retry max delay".to_string(),
            ));
        }

        if self.max_operation_attempts == 0 {
            return Err(Error::Config(
                "Max operation attempts must be at least 1".to_string(),
            ));
        }

        if self.max_pending_operations == 0 {
            return Err(Error::Config(
                "Max pending operations must be greater than 0".to_string(),
            ));
        }

        if matches!(self.max_pending_operation_age, Some(age) if age.is_zero()) {
            return Err(Error::Config(
                "Max pending operation age must be greater than 0; use None to disable".to_string(),
            ));
        }

        if matches!(self.sync_interval, Some(interval) if interval.is_zero()) {
            return Err(Error::Config(
                "Sync interval must be greater than 0; use None to disable".to_string(),
            ));
        }

        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(Error::Config(
                "Namespace must be non-empty and must not contain ':'".to_string(),
            ));
        }

        if self.enable_realtime_feed && self.push_connector.is_none() {
            return Err(Error::Config(
                "Realtime feed enabled but no PushConnector provided. \
                 Disable the feed or inject a PushConnector implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Derive the feed URL from the API base URL.
///
/// `https://api.example.com` becomes `wss://api.example.com/v0/feed`.
pub fn derive_feed_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    };
    format!("{}/v0/feed", ws)
}

#[cfg(not(feature = "desktop-shims"))]
fn capability_missing(capability: &str, detail: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: format!(
            "{} Desktop: ensure the 'desktop-shims' feature is enabled. \
             Mobile/Web: inject a platform-native implementation.",
            detail
        ),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    let client = bridge_desktop::ReqwestHttpClient::with_timeout(timeout)
        .map_err(|e| Error::Internal(format!("Failed to initialize default HttpClient: {}", e)))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpClient>> {
    Err(capability_missing(
        "HttpClient",
        "An HttpClient implementation is required to reach the remote API.",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_local_store(database_path: Option<PathBuf>) -> Result<Arc<dyn LocalStore>> {
    use bridge_desktop::{MemoryLocalStore, SqliteLocalStore};
    use std::thread;
    use tokio::runtime::{Handle, Runtime};

    let Some(path) = database_path else {
        return Ok(Arc::new(MemoryLocalStore::new()));
    };

    let init_store = |path: PathBuf| -> Result<SqliteLocalStore> {
        let runtime = Runtime::new().map_err(|e| {
            Error::Internal(format!(
                "Failed to create Tokio runtime for default LocalStore: {}",
                e
            ))
        })?;

        runtime
            .block_on(SqliteLocalStore::new(path))
            .map_err(|e| Error::Internal(format!("Failed to initialize default LocalStore: {}", e)))
    };

    // A runtime cannot be blocked on from inside another one
    let store = match Handle::try_current() {
        Ok(_) => thread::spawn(move || init_store(path))
            .join()
            .map_err(|_| {
                Error::Internal("Worker thread panicked while creating default LocalStore".to_string())
            })??,
        Err(_) => init_store(path)?,
    };

    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_local_store(_database_path: Option<PathBuf>) -> Result<Arc<dyn LocalStore>> {
    Err(capability_missing(
        "LocalStore",
        "A LocalStore implementation is required to persist the cache and operation log.",
    ))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_push_connector() -> Option<Arc<dyn PushConnector>> {
    Some(Arc::new(bridge_desktop::WebSocketPushConnector::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_push_connector() -> Option<Arc<dyn PushConnector>> {
    None
}

/// Builder for [`SyncClientConfig`].
pub struct SyncClientConfigBuilder {
    credential_source: Option<Arc<dyn CredentialSource>>,
    base_url: Option<String>,
    feed_url: Option<String>,
    http_client: Option<Arc<dyn HttpClient>>,
    local_store: Option<Arc<dyn LocalStore>>,
    database_path: Option<PathBuf>,
    push_connector: Option<Arc<dyn PushConnector>>,
    request_timeout: Duration,
    max_retry_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    enable_offline_queue: bool,
    enable_realtime_feed: bool,
    max_pending_operation_age: Option<Duration>,
    max_pending_operations: usize,
    max_operation_attempts: u32,
    sync_interval: Option<Duration>,
    namespace: String,
    event_buffer_size: usize,
}

impl Default for SyncClientConfigBuilder {
    fn default() -> Self {
        Self {
            credential_source: None,
            base_url: None,
            feed_url: None,
            http_client: None,
            local_store: None,
            database_path: None,
            push_connector: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            enable_offline_queue: true,
            enable_realtime_feed: true,
            max_pending_operation_age: Some(DEFAULT_MAX_PENDING_OPERATION_AGE),
            max_pending_operations: DEFAULT_MAX_PENDING_OPERATIONS,
            max_operation_attempts: DEFAULT_MAX_OPERATION_ATTEMPTS,
            sync_interval: Some(DEFAULT_SYNC_INTERVAL),
            namespace: DEFAULT_NAMESPACE.to_string(),
            event_buffer_size: crate::events::DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl SyncClientConfigBuilder {
    /// Sets the credential source (required).
    pub fn credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credential_source = Some(source);
        self
    }

    /// Sets the remote API base URL (required).
    ///
    /// A trailing slash is ignored.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    /// Overrides the real-time feed URL.
    ///
    /// Default: derived from the base URL, see [`derive_feed_url`].
    pub fn feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = Some(url.into());
        self
    }

    /// Sets the HTTP client implementation.
    ///
    /// If not provided, the desktop default (reqwest-based) will be used when
    /// the `desktop-shims` feature is enabled.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the local store implementation.
    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local_store = Some(store);
        self
    }

    /// Persist to a SQLite file at `path` when no local store is injected.
    ///
    /// Only used with the `desktop-shims` feature.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the push connector used by the real-time feed.
    pub fn push_connector(mut self, connector: Arc<dyn PushConnector>) -> Self {
        self.push_connector = Some(connector);
        self
    }

    /// Default: 30 000 ms
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Default: 3
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Default: 1 000 ms
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Default: 30 000 ms
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Default: true
    pub fn enable_offline_queue(mut self, enabled: bool) -> Self {
        self.enable_offline_queue = enabled;
        self
    }

    /// Default: true
    pub fn enable_realtime_feed(mut self, enabled: bool) -> Self {
        self.enable_realtime_feed = enabled;
        self
    }

    /// Default: 7 days
    pub fn max_pending_operation_age(mut self, age: Option<Duration>) -> Self {
        self.max_pending_operation_age = age;
        self
    }

    /// Default: 10 000
    pub fn max_pending_operations(mut self, cap: usize) -> Self {
        self.max_pending_operations = cap;
        self
    }

    /// Default: 5
    pub fn max_operation_attempts(mut self, attempts: u32) -> Self {
        self.max_operation_attempts = attempts;
        self
    }

    /// Default: 30 s
    pub fn sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Default: `recordsync`
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Default: 256
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Builds the final `SyncClientConfig` instance.
    ///
    /// # Errors
    ///
    /// Returns an error if a required value is missing, a capability has no
    /// implementation, or validation fails.
    pub fn build(self) -> Result<SyncClientConfig> {
        let credential_source = self.credential_source.ok_or_else(|| {
            Error::Config(
                "Credential source is required. Use .credential_source() to set it.".to_string(),
            )
        })?;

        let base_url = self.base_url.ok_or_else(|| {
            Error::Config("Base URL is required. Use .base_url() to set it.".to_string())
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client(self.request_timeout)?,
        };

        let local_store = match self.local_store {
            Some(store) => store,
            None => provide_default_local_store(self.database_path)?,
        };

        let push_connector = match self.push_connector {
            Some(connector) => Some(connector),
            None if self.enable_realtime_feed => provide_default_push_connector(),
            None => None,
        };

        let feed_url = self
            .feed_url
            .unwrap_or_else(|| derive_feed_url(&base_url));

        let config = SyncClientConfig {
            credential_source,
            base_url,
            feed_url,
            http_client,
            local_store,
            push_connector,
            request_timeout: self.request_timeout,
            max_retry_attempts: self.max_retry_attempts,
            retry_base_delay: self.retry_base_delay,
            retry_max_delay: self.retry_max_delay,
            enable_offline_queue: self.enable_offline_queue,
            enable_realtime_feed: self.enable_realtime_feed,
            max_pending_operation_age: self.max_pending_operation_age,
            max_pending_operations: self.max_pending_operations,
            max_operation_attempts: self.max_operation_attempts,
            sync_interval: self.sync_interval,
            namespace: self.namespace,
            event_buffer_size: self.event_buffer_size,
        };

        config.validate()?;

        Ok(config)
    }
}
