//! Error types for the market stream

use thiserror::Error;

/// Market stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Upstream feed lost, never established, or its adapter has stopped.
    /// Cached values stay servable as last-known-good.
    #[error("Feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("Callback {id} for {symbol} failed: {reason}")]
    CallbackFailure {
        symbol: String,
        id: u64,
        reason: String,
    },

    #[error("Write to connection {id} failed: {reason}")]
    ConnectionWriteFailure { id: u64, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl StreamError {
    /// Whether this error should reach the operator rather than stay contained
    pub fn is_feed_unavailable(&self) -> bool {
        matches!(
            self,
            StreamError::FeedUnavailable(_) | StreamError::ConnectionTimeout
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::FeedUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::FeedUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Persistence(err.to_string())
    }
}

impl From<prometheus::Error> for StreamError {
    fn from(err: prometheus::Error) -> Self {
        StreamError::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
