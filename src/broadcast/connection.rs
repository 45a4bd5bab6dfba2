//! Per-connection state and the writer task draining its queue

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::metrics::Metrics;

pub type ConnectionId = u64;

/// Lifecycle of one dashboard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Active,
    Closed,
}

/// Write half of a client connection
#[async_trait]
pub trait ClientSink: Send + 'static {
    /// Send one text frame
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send a keepalive ping
    async fn send_ping(&mut self) -> Result<()>;

    /// Close the underlying channel; errors are ignored
    async fn close(&mut self);
}

/// Frames queued for one connection
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Text(Arc<str>),
    Batch(Vec<Arc<str>>),
    Ping,
}

/// Connection state shared between the manager and the writer task
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        let raw = match state {
            ConnectionState::Connecting => 0,
            ConnectionState::Active => 1,
            ConnectionState::Closed => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// Manager-side record of a registered connection
pub(crate) struct ConnectionSlot {
    pub(crate) tx: mpsc::Sender<Outbound>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) peer: String,
    pub(crate) lagged: u32,
}

pub(crate) type ConnectionMap = Arc<Mutex<HashMap<ConnectionId, ConnectionSlot>>>;

/// Everything a writer task needs besides its sink and queue
pub(crate) struct WriterContext {
    pub(crate) id: ConnectionId,
    pub(crate) state: Arc<StateCell>,
    pub(crate) connections: ConnectionMap,
    pub(crate) write_timeout: Duration,
    pub(crate) metrics: Arc<Metrics>,
}

/// Drain the queue into the sink until it closes, the connection is removed,
/// or a write fails. A failed write removes the connection from the set.
pub(crate) async fn run_writer<S: ClientSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    ctx: WriterContext,
) {
    while let Some(message) = rx.recv().await {
        if ctx.state.get() == ConnectionState::Closed {
            break;
        }

        if let Err(e) = write_message(&mut sink, &message, ctx.write_timeout).await {
            let failure = StreamError::ConnectionWriteFailure {
                id: ctx.id,
                reason: e.to_string(),
            };
            warn!(error = %failure, "Evicting connection");
            ctx.metrics.connection_write_failures.inc();

            ctx.state.set(ConnectionState::Closed);
            if ctx.connections.lock().remove(&ctx.id).is_some() {
                ctx.metrics.connections_evicted.inc();
                ctx.metrics.active_connections.dec();
            }
            break;
        }
    }

    sink.close().await;
    debug!(connection_id = ctx.id, "Writer stopped");
}

async fn write_message<S: ClientSink>(
    sink: &mut S,
    message: &Outbound,
    write_timeout: Duration,
) -> Result<()> {
    match message {
        Outbound::Text(text) => write_with_timeout(sink.send_text(text), write_timeout).await,
        Outbound::Batch(frames) => {
            for frame in frames {
                write_with_timeout(sink.send_text(frame), write_timeout).await?;
            }
            Ok(())
        }
        Outbound::Ping => write_with_timeout(sink.send_ping(), write_timeout).await,
    }
}

async fn write_with_timeout<F>(write: F, write_timeout: Duration) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match timeout(write_timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(StreamError::ConnectionTimeout),
    }
}
