//! Upstream gateway wire protocol
//!
//! Inbound messages are JSON objects tagged by `type`; outbound commands ask
//! the gateway to start or stop a symbol.

use serde::{Deserialize, Serialize};

use crate::tick::{Symbol, Tick};

/// Gateway error payload
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayError {
    pub message: String,

    #[serde(default)]
    pub code: Option<i64>,

    /// Gateway lost its own upstream; no ticks until it recovers
    #[serde(default)]
    pub fatal: bool,
}

/// Parsed gateway message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Tick(Tick),
    Error(GatewayError),
    Heartbeat,
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw gateway message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        match value.get("type").and_then(|t| t.as_str()) {
            Some("tick") => Ok(ParsedMessage::Tick(serde_json::from_value(value)?)),
            Some("error") => Ok(ParsedMessage::Error(serde_json::from_value(value)?)),
            Some("heartbeat") => Ok(ParsedMessage::Heartbeat),
            _ => Ok(ParsedMessage::Unknown(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

/// Command sent to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedCommand {
    pub action: Action,
    pub symbol: Symbol,
}

impl FeedCommand {
    pub fn subscribe(symbol: Symbol) -> Self {
        Self {
            action: Action::Subscribe,
            symbol,
        }
    }

    pub fn unsubscribe(symbol: Symbol) -> Self {
        Self {
            action: Action::Unsubscribe,
            symbol,
        }
    }
}
