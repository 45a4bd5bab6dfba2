//! Latest-value cache
//!
//! Holds the most recent tick per symbol. Writers replace whole entries under
//! a short write lock, so readers always see either the previous or the new
//! tick, never a mix of both.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::tick::{Symbol, Tick};

#[derive(Debug, Clone)]
struct CachedTick {
    tick: Tick,
    received_at: Instant,
}

/// Most recent tick per active symbol
#[derive(Debug, Default)]
pub struct LatestValueCache {
    entries: RwLock<HashMap<Symbol, CachedTick>>,
}

impl LatestValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored value for `tick.symbol`
    pub fn update(&self, tick: Tick) {
        let entry = CachedTick {
            tick,
            received_at: Instant::now(),
        };
        self.entries.write().insert(entry.tick.symbol.clone(), entry);
    }

    /// Latest tick, or `None` when nothing has arrived yet
    pub fn get(&self, symbol: &str) -> Option<Tick> {
        self.entries.read().get(symbol).map(|entry| entry.tick.clone())
    }

    /// Drop the entry for a symbol, returning what was cached
    pub fn evict(&self, symbol: &str) -> Option<Tick> {
        self.entries.write().remove(symbol).map(|entry| entry.tick)
    }

    /// All cached ticks, ordered by symbol
    pub fn snapshot(&self) -> BTreeMap<Symbol, Tick> {
        self.entries
            .read()
            .iter()
            .map(|(symbol, entry)| (symbol.clone(), entry.tick.clone()))
            .collect()
    }

    /// Ticks that have not been refreshed for at least `age`
    pub fn quiet_since(&self, age: Duration) -> Vec<Tick> {
        let now = Instant::now();
        let mut quiet: Vec<Tick> = self
            .entries
            .read()
            .values()
            .filter(|entry| now.duration_since(entry.received_at) >= age)
            .map(|entry| entry.tick.clone())
            .collect();
        quiet.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        quiet
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
