//! Dashboard WebSocket endpoint

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::broadcast::ClientSink;
use crate::error::{Result, StreamError};
use crate::service::MarketStream;

/// Write half of an axum WebSocket
pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl ClientSink for WsSink {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.0
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.0
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// Handle WebSocket upgrade request
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(stream): State<Arc<MarketStream>>,
) -> Response {
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, stream, peer))
}

/// Register the write half and hold the read half until the client leaves.
/// Client messages carry no commands and are discarded.
async fn handle_socket(socket: WebSocket, stream: Arc<MarketStream>, peer: String) {
    let (sender, mut receiver) = socket.split();
    let connections = stream.connections().clone();
    let id = connections.register(WsSink(sender), peer);

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    connections.remove(id);
    info!(connection_id = id, "WebSocket client disconnected");
}
