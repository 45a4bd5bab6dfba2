//! Feed adapter boundary
//!
//! Adapters emit `FeedEvent`s into an mpsc channel consumed by the
//! dispatcher, and accept start/stop requests per symbol.

mod client;
pub mod protocol;
mod simulated;
mod websocket;

pub use client::UpstreamClient;
pub use simulated::SimulatedFeed;
pub use websocket::WebSocketFeed;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::tick::{Symbol, Tick};

/// Source of ticks for subscribed symbols
#[cfg_attr(test, mockall::automock)]
pub trait FeedAdapter: Send + Sync {
    /// Begin emitting ticks for `symbol`
    fn start_feed(&self, symbol: &Symbol) -> Result<()>;

    /// Stop emitting ticks for `symbol`
    fn stop_feed(&self, symbol: &Symbol) -> Result<()>;
}

/// Event produced by a feed adapter
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick(Tick),
    /// Upstream connection lost or refused
    Unavailable(String),
    /// Upstream connection (re-)established
    Restored,
}

/// Connectivity of the upstream feed as seen by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum FeedStatus {
    Connecting,
    Connected,
    Unavailable {
        reason: String,
        since: DateTime<Utc>,
    },
}

impl FeedStatus {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        FeedStatus::Unavailable {
            reason: reason.into(),
            since: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, FeedStatus::Connected)
    }
}
