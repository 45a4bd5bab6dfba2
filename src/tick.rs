//! Tick and symbol types
//!
//! A `Tick` is the unit every consumer sees: one timestamped market-data
//! snapshot for a single symbol. Numeric fields are optional because the feed
//! may not have produced a value yet; they serialize as `null`, never as zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StreamError};

const MAX_SYMBOL_LEN: usize = 32;

/// Uppercase ticker identifying a tradable instrument
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Normalize and validate a ticker string
    pub fn parse(raw: &str) -> Result<Self> {
        let symbol = raw.trim().to_uppercase();

        if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
            return Err(StreamError::InvalidSymbol(raw.to_string()));
        }

        let valid = symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'));
        if !valid {
            return Err(StreamError::InvalidSymbol(raw.to_string()));
        }

        Ok(Self(symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Symbol {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Market-data snapshot for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: Symbol,

    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub bid: Option<Decimal>,

    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub ask: Option<Decimal>,

    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub last: Option<Decimal>,

    /// Previous session close
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub close: Option<Decimal>,

    #[serde(default)]
    pub volume: Option<u64>,

    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub high: Option<Decimal>,

    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub low: Option<Decimal>,

    #[serde(default)]
    pub bid_size: Option<u64>,

    #[serde(default)]
    pub ask_size: Option<u64>,

    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Create a tick with no values yet, stamped now
    pub fn new(symbol: Symbol) -> Self {
        Self::at(symbol, Utc::now())
    }

    /// Create a tick with no values yet at a given time
    pub fn at(symbol: Symbol, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            bid: None,
            ask: None,
            last: None,
            close: None,
            volume: None,
            high: None,
            low: None,
            bid_size: None,
            ask_size: None,
            timestamp,
        }
    }

    /// Serialize to the JSON frame pushed to dashboard clients
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StreamError::SerializationError(e.to_string()))
    }
}
