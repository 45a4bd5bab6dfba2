//! WebSocket client for the upstream market-data gateway
//!
//! Handles connection, command sending, and message reception.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StreamError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single gateway connection
pub struct UpstreamClient {
    stream: Option<WsStream>,
    endpoint: String,
}

impl UpstreamClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
        }
    }

    /// Connect to the gateway endpoint
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.endpoint, "Connecting to feed gateway");

        let (ws_stream, response) = connect_async(self.endpoint.as_str()).await.map_err(|e| {
            StreamError::FeedUnavailable(format!("Failed to connect to {}: {}", self.endpoint, e))
        })?;

        info!(status = ?response.status(), "Feed gateway connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    /// Send a JSON command
    pub async fn send_json<T: Serialize>(&mut self, command: &T) -> Result<()> {
        let text = serde_json::to_string(command)
            .map_err(|e| StreamError::SerializationError(e.to_string()))?;

        let sent = self.stream_mut()?.send(Message::Text(text)).await;
        if let Err(e) = sent {
            self.stream = None;
            return Err(StreamError::FeedUnavailable(e.to_string()));
        }
        Ok(())
    }

    /// Receive the next data message; `None` for control frames
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self.stream_mut()?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => Ok(Some(String::from_utf8_lossy(&data).to_string())),
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(StreamError::FeedUnavailable("Connection closed".to_string()))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(StreamError::FeedUnavailable(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(StreamError::FeedUnavailable("Stream ended".to_string()))
            }
        }
    }

    /// Send a ping to keep the connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| StreamError::FeedUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| StreamError::FeedUnavailable("Not connected".to_string()))
    }
}
