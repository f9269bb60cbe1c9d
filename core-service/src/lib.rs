//! Sync client façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, local store,
//! push connection, credentials) into the sync engine and exposes a single
//! [`SyncClient`] to applications. Desktop apps typically enable the
//! `desktop-shims` feature (which depends on `bridge-desktop`) and let
//! [`SyncClientConfig`] fill in the default bridges.
//!
//! ```ignore
//! use core_service::{SyncClient, SyncClientConfig};
//!
//! let config = SyncClientConfig::builder()
//!     .credential_source(source)
//!     .base_url("https://api.example.com")
//!     .build()?;
//! let client = SyncClient::new(config).await?;
//!
//! let table = TableRef::new("app123", "tasks");
//! let record = client.create_record(&table, fields).await?; // visible at once
//! client.sync().await?;                                     // delivered
//! ```

mod client;
pub mod error;
mod query;

pub use client::{ReadOptions, SyncClient};
pub use core_runtime::config::SyncClientConfig;
pub use core_runtime::events::{CoreEvent, EventBus};
pub use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
pub use core_sync::SyncResult;
pub use error::{ClientError, Result};
pub use provider_records::{
    ConnectionState, Fields, ListQuery, Record, SortSpec, TableRef,
};

use std::sync::Arc;

use bridge_traits::{Clock, LocalStore, PushConnector, SystemClock};
use core_auth::CredentialManager;
use provider_records::{ConnectionMonitor, RecordApi, RecordsConnector};

/// Aggregated handle to everything the client depends on.
pub struct SyncDependencies {
    pub api: Arc<dyn RecordApi>,
    pub credentials: CredentialManager,
    pub local_store: Arc<dyn LocalStore>,
    pub push_connector: Option<Arc<dyn PushConnector>>,
    pub clock: Arc<dyn Clock>,
    pub event_bus: EventBus,
}

impl SyncDependencies {
    /// Construct a dependency bundle from explicit handles.
    pub fn new(
        api: Arc<dyn RecordApi>,
        credentials: CredentialManager,
        local_store: Arc<dyn LocalStore>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            api,
            credentials,
            local_store,
            push_connector: None,
            clock: Arc::new(SystemClock),
            event_bus,
        }
    }

    pub fn with_push_connector(mut self, connector: Arc<dyn PushConnector>) -> Self {
        self.push_connector = Some(connector);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the transport stack described by `config`.
    pub fn from_config(config: &SyncClientConfig) -> Self {
        let event_bus = EventBus::new(config.event_buffer_size);
        let credentials =
            CredentialManager::new(Arc::clone(&config.credential_source), event_bus.clone());
        let connection = ConnectionMonitor::default().with_event_bus(event_bus.clone());
        let connector = RecordsConnector::new(
            Arc::clone(&config.http_client),
            credentials.clone(),
            config.base_url.clone(),
        )
        .with_retry_policy(config.retry_policy())
        .with_request_timeout(config.request_timeout)
        .with_connection(connection);

        Self {
            api: Arc::new(connector),
            credentials,
            local_store: Arc::clone(&config.local_store),
            push_connector: config.push_connector.clone(),
            clock: Arc::new(SystemClock),
            event_bus,
        }
    }
}
