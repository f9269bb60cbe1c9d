//! # Host Bridge Traits
//!
//! Capability contracts the sync engine consumes but does not implement.
//!
//! ## Overview
//!
//! Each trait represents something the engine requires but that is provided
//! differently per host (desktop, mobile, web). Concrete desktop adapters live
//! in `bridge-desktop`.
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Single-attempt async HTTP with multipart upload
//! - [`PushConnector`](push::PushConnector) - Persistent push connection for the real-time feed
//!
//! ### Storage & Credentials
//! - [`LocalStore`](storage::LocalStore) - Durable key-value store for cache and operation log
//! - [`CredentialSource`](credentials::CredentialSource) - Bearer credential supply and refresh
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! must report failures that happened before any response arrived as
//! `Network`/`Timeout` so the transport can classify them as retryable.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.

pub mod credentials;
pub mod error;
pub mod http;
pub mod push;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use credentials::{Credential, CredentialSource};
pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, MultipartFile, ProgressCallback,
    RetryPolicy,
};
pub use push::{PushConnection, PushConnector};
pub use storage::LocalStore;
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
