//! Configuration module for the market stream service

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::tick::Symbol;

/// Where ticks come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Upstream WebSocket gateway
    WebSocket,
    /// Local random-walk generator
    Simulated,
}

impl FromStr for FeedMode {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "websocket" | "ws" => Ok(FeedMode::WebSocket),
            "simulated" | "sim" => Ok(FeedMode::Simulated),
            other => Err(StreamError::ConfigError(format!("unknown FEED_MODE {:?}", other))),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Symbols subscribed at startup (e.g., ["AAPL", "TSLA"])
    pub symbols: Vec<Symbol>,

    /// Address the HTTP/WebSocket server binds to
    pub bind_address: String,

    pub feed_mode: FeedMode,

    /// WebSocket endpoint of the upstream gateway
    pub feed_endpoint: String,

    /// Optional REST endpoint for initial quote snapshots
    pub rest_endpoint: Option<String>,

    /// Reconnection settings; zero attempts means retry forever
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    pub simulated_interval_ms: u64,

    /// Dashboard heartbeat period
    pub heartbeat_interval_secs: u64,

    /// Per-consumer queue sizes
    pub client_queue_capacity: usize,
    pub callback_queue_capacity: usize,
    pub feed_event_capacity: usize,

    /// Consecutive dropped messages before a consumer is evicted
    pub max_lagged_messages: u32,

    pub write_timeout_ms: u64,

    /// Directory for per-symbol JSONL recordings
    pub record_dir: Option<PathBuf>,

    /// File the cache snapshot is exported to on shutdown
    pub snapshot_path: Option<PathBuf>,

    /// Attach a logging callback to every startup symbol
    pub log_ticks: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse a comma-separated symbol list, skipping blanks
pub fn parse_symbols(raw: &str) -> Result<Vec<Symbol>> {
    let mut symbols: Vec<Symbol> = Vec::new();
    for part in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let symbol = Symbol::parse(part)?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    Ok(symbols)
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let symbols = match env_opt("SYMBOLS") {
            Some(raw) => parse_symbols(&raw)
                .map_err(|e| StreamError::ConfigError(format!("SYMBOLS: {}", e)))?,
            None => defaults.symbols,
        };

        let feed_mode = match env_opt("FEED_MODE") {
            Some(raw) => raw.parse()?,
            None => defaults.feed_mode,
        };

        let config = Self {
            symbols,
            bind_address: env_opt("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            feed_mode,
            feed_endpoint: env_opt("FEED_ENDPOINT").unwrap_or(defaults.feed_endpoint),
            rest_endpoint: env_opt("FEED_REST_ENDPOINT"),
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            simulated_interval_ms: env_or("SIMULATED_INTERVAL_MS", defaults.simulated_interval_ms),
            heartbeat_interval_secs: env_or("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval_secs),
            client_queue_capacity: env_or("CLIENT_QUEUE_CAPACITY", defaults.client_queue_capacity),
            callback_queue_capacity: env_or("CALLBACK_QUEUE_CAPACITY", defaults.callback_queue_capacity),
            feed_event_capacity: env_or("FEED_EVENT_CAPACITY", defaults.feed_event_capacity),
            max_lagged_messages: env_or("MAX_LAGGED_MESSAGES", defaults.max_lagged_messages),
            write_timeout_ms: env_or("WRITE_TIMEOUT_MS", defaults.write_timeout_ms),
            record_dir: env_opt("RECORD_DIR").map(PathBuf::from),
            snapshot_path: env_opt("SNAPSHOT_PATH").map(PathBuf::from),
            log_ticks: env_or("LOG_TICKS", defaults.log_ticks),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("CLIENT_QUEUE_CAPACITY", self.client_queue_capacity as u64),
            ("CALLBACK_QUEUE_CAPACITY", self.callback_queue_capacity as u64),
            ("FEED_EVENT_CAPACITY", self.feed_event_capacity as u64),
            ("MAX_LAGGED_MESSAGES", self.max_lagged_messages as u64),
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval_secs),
            ("WRITE_TIMEOUT_MS", self.write_timeout_ms),
            ("SIMULATED_INTERVAL_MS", self.simulated_interval_ms),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(StreamError::ConfigError(format!("{} must be greater than zero", key)));
        }

        if self.feed_mode == FeedMode::WebSocket && self.feed_endpoint.is_empty() {
            return Err(StreamError::ConfigError(
                "FEED_ENDPOINT is required in websocket mode".to_string(),
            ));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn simulated_interval(&self) -> Duration {
        Duration::from_millis(self.simulated_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: parse_symbols("AAPL,TSLA").unwrap_or_default(),
            bind_address: "0.0.0.0:8000".to_string(),
            feed_mode: FeedMode::WebSocket,
            feed_endpoint: "ws://127.0.0.1:4002/stream".to_string(),
            rest_endpoint: None,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 0,
            simulated_interval_ms: 500,
            heartbeat_interval_secs: 2,
            client_queue_capacity: 256,
            callback_queue_capacity: 1024,
            feed_event_capacity: 4096,
            max_lagged_messages: 512,
            write_timeout_ms: 5000,
            record_dir: None,
            snapshot_path: None,
            log_ticks: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(
            config.symbols.iter().map(Symbol::as_str).collect::<Vec<_>>(),
            vec!["AAPL", "TSLA"]
        );
    }

    #[test]
    fn test_parse_symbols() {
        let symbols = parse_symbols(" aapl, tsla,,AAPL ,msft").unwrap();
        assert_eq!(
            symbols.iter().map(Symbol::as_str).collect::<Vec<_>>(),
            vec!["AAPL", "TSLA", "MSFT"]
        );
        assert!(parse_symbols("AAPL,BAD SYMBOL").is_err());
        assert!(parse_symbols("").unwrap().is_empty());
    }

    #[test]
    fn test_feed_mode_parse() {
        assert_eq!("WebSocket".parse::<FeedMode>().unwrap(), FeedMode::WebSocket);
        assert_eq!(" simulated ".parse::<FeedMode>().unwrap(), FeedMode::Simulated);
        assert!(matches!(
            "carrier-pigeon".parse::<FeedMode>(),
            Err(StreamError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = Config {
            client_queue_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(StreamError::ConfigError(msg)) if msg.contains("CLIENT_QUEUE_CAPACITY")));
    }

    #[test]
    fn test_validate_endpoint_only_required_for_websocket() {
        let mut config = Config {
            feed_endpoint: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.feed_mode = FeedMode::Simulated;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("MARKET_STREAM_TEST_PORT", "not-a-number");
        assert_eq!(env_or("MARKET_STREAM_TEST_PORT", 42u16), 42);
        env::set_var("MARKET_STREAM_TEST_PORT", " 7 ");
        assert_eq!(env_or("MARKET_STREAM_TEST_PORT", 42u16), 7);
        env::remove_var("MARKET_STREAM_TEST_PORT");
    }
}
