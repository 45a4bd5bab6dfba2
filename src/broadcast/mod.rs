//! Broadcast module for dashboard clients
//!
//! Owns the live connection set and pushes ticks to every active client.

mod connection;
mod manager;

pub use connection::{ClientSink, ConnectionId, ConnectionState};
pub use manager::{BroadcastReport, ConnectionManager};
