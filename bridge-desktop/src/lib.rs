//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest` (single attempt, multipart upload with progress)
//! - `LocalStore` using SQLite via `sqlx`, or an in-memory map
//! - `PushConnector` using WebSocket via `tokio-tungstenite`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SqliteLocalStore, WebSocketPushConnector};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let store = SqliteLocalStore::new("/var/lib/app/sync.db".into()).await?;
//!     let push = WebSocketPushConnector::new();
//!
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod http;
mod memory;
mod push;
mod store;

pub use http::ReqwestHttpClient;
pub use memory::MemoryLocalStore;
pub use push::WebSocketPushConnector;
pub use store::SqliteLocalStore;
