//! Market Stream - live market-data fan-out
//!
//! Distributes ticks from one upstream feed to in-process callbacks and
//! WebSocket dashboard clients, keeping the latest value per symbol so new
//! consumers start from a full snapshot.

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod handler;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod server;
pub mod service;
pub mod tick;

pub use broadcast::{BroadcastReport, ClientSink, ConnectionId, ConnectionManager, ConnectionState};
pub use cache::LatestValueCache;
pub use config::{Config, FeedMode};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{Result, StreamError};
pub use feed::{FeedAdapter, FeedEvent, FeedStatus, SimulatedFeed, WebSocketFeed};
pub use handler::{handler_fn, LoggingHandler, TickHandler};
pub use metrics::Metrics;
pub use persistence::JsonlRecorder;
pub use registry::{SubscriptionHandle, SubscriptionId, SubscriptionRegistry, UnsubscribeOutcome};
pub use service::MarketStream;
pub use tick::{Symbol, Tick};
