//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the push-channel URL for one ComfyUI server.
//! Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`], or use it as an [`EventSource`] to connect and
//! spawn a [`run_listener`] task in one step.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backend::EventSource;
use crate::events::{BackendEvent, ConnectionId};
use crate::listener::run_listener;

/// Connection handle for a ComfyUI push channel.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
#[derive(Debug)]
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake. ComfyUI addresses
    /// job events for prompts submitted with this id to this socket.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the ComfyUI WebSocket endpoint as `client_id`.
    ///
    /// The same client id must be used when submitting prompts, otherwise
    /// ComfyUI sends their events to a different socket.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

#[async_trait]
impl EventSource for ComfyUIClient {
    async fn open(
        &self,
        client_id: &str,
        connection: ConnectionId,
        events: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, ComfyUIClientError> {
        let ComfyUIConnection {
            client_id,
            ws_stream,
        } = self.connect(client_id).await?;
        Ok(tokio::spawn(async move {
            run_listener(ws_stream, connection, events, cancel).await;
            tracing::info!(connection, client_id = %client_id, "Listener task exited");
        }))
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
