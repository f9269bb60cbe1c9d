//! Push Connection Abstraction
//!
//! A persistent, bidirectional text-message channel used by the real-time
//! feed. Desktop uses WebSocket; other hosts may use whatever their platform
//! offers as long as messages are delivered in order.

use async_trait::async_trait;

use crate::error::Result;

/// Opens push connections.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Open a connection to `url`, authenticating with `bearer_token`.
    async fn connect(&self, url: &str, bearer_token: &str) -> Result<Box<dyn PushConnection>>;
}

/// One open push connection.
///
/// Dropping the connection closes it.
#[async_trait]
pub trait PushConnection: Send {
    /// Send a text frame.
    async fn send(&mut self, message: String) -> Result<()>;

    /// Wait for the next text frame.
    ///
    /// Returns `None` once the peer closed the connection. Must be cancel-safe:
    /// dropping the returned future loses no message.
    async fn next_message(&mut self) -> Option<Result<String>>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<()>;
}
