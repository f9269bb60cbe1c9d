//! Push connection over WebSocket

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    push::{PushConnection, PushConnector},
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections for the real-time feed.
#[derive(Debug, Default, Clone)]
pub struct WebSocketPushConnector;

impl WebSocketPushConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PushConnector for WebSocketPushConnector {
    async fn connect(&self, url: &str, bearer_token: &str) -> Result<Box<dyn PushConnection>> {
        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid feed URL: {}", e)))?;

        let auth = HeaderValue::from_str(&format!("Bearer {}", bearer_token))
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid credential: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BridgeError::Network(format!("WebSocket connect failed: {}", e)))?;

        debug!(url, status = response.status().as_u16(), "Push connection established");
        Ok(Box::new(WebSocketConnection { socket }))
    }
}

struct WebSocketConnection {
    socket: Socket,
}

#[async_trait]
impl PushConnection for WebSocketConnection {
    async fn send(&mut self, message: String) -> Result<()> {
        self.socket
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| BridgeError::ConnectionClosed(format!("send failed: {}", e)))?;

        // Flush so a broken connection is noticed on send rather than later
        self.socket
            .flush()
            .await
            .map_err(|e| BridgeError::ConnectionClosed(format!("flush failed: {}", e)))
    }

    async fn next_message(&mut self) -> Option<Result<String>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Push connection closed by peer");
                    return None;
                }
                // Ping replies are queued by tungstenite itself
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Push connection receive failed");
                    return Some(Err(BridgeError::ConnectionClosed(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.socket
            .close(None)
            .await
            .map_err(|e| BridgeError::ConnectionClosed(format!("close failed: {}", e)))
    }
}
