//! Simulated feed adapter
//!
//! Random-walk quotes for every started symbol, emitted on a fixed interval.
//! Used for demos and for running the service without a gateway.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{FeedAdapter, FeedEvent};
use crate::error::Result;
use crate::tick::{Symbol, Tick};

/// Half spread around the last price, in cents
const HALF_SPREAD_CENTS: i64 = 5;
/// Largest single step of the walk, in cents
const MAX_STEP_CENTS: i64 = 25;

fn seed_price_cents(symbol: &Symbol) -> i64 {
    match symbol.as_str() {
        "AAPL" => 15_025,
        "TSLA" => 24_580,
        _ => 10_000,
    }
}

fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

/// Walk state for one symbol
#[derive(Debug, Clone)]
struct SimState {
    close: i64,
    last: i64,
    high: i64,
    low: i64,
    volume: u64,
}

impl SimState {
    fn new(symbol: &Symbol) -> Self {
        let seed = seed_price_cents(symbol);
        Self {
            close: seed,
            last: seed,
            high: seed,
            low: seed,
            volume: 0,
        }
    }

    fn step<R: Rng>(&mut self, rng: &mut R) {
        let step = rng.gen_range(-MAX_STEP_CENTS..=MAX_STEP_CENTS);
        // Keep a spread's worth of room above zero
        self.last = (self.last + step).max(HALF_SPREAD_CENTS + 1);
        self.high = self.high.max(self.last);
        self.low = self.low.min(self.last);
        self.volume += rng.gen_range(100..=5_000);
    }

    fn to_tick<R: Rng>(&self, symbol: &Symbol, rng: &mut R) -> Tick {
        Tick {
            bid: Some(cents(self.last - HALF_SPREAD_CENTS)),
            ask: Some(cents(self.last + HALF_SPREAD_CENTS)),
            last: Some(cents(self.last)),
            close: Some(cents(self.close)),
            volume: Some(self.volume),
            high: Some(cents(self.high)),
            low: Some(cents(self.low)),
            bid_size: Some(rng.gen_range(1..=50) * 100),
            ask_size: Some(rng.gen_range(1..=50) * 100),
            ..Tick::at(symbol.clone(), Utc::now())
        }
    }
}

/// Feed adapter producing random-walk ticks
pub struct SimulatedFeed {
    active: Arc<Mutex<BTreeMap<Symbol, SimState>>>,
}

impl SimulatedFeed {
    /// Spawn the generator task. It stops when the event receiver is dropped.
    pub fn spawn(interval: Duration, events: mpsc::Sender<FeedEvent>) -> (Arc<Self>, JoinHandle<()>) {
        let active: Arc<Mutex<BTreeMap<Symbol, SimState>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let state = active.clone();

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Simulated feed started");
            if events.send(FeedEvent::Restored).await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let ticks: Vec<Tick> = {
                    let mut rng = rand::thread_rng();
                    let mut active = state.lock();
                    active
                        .iter_mut()
                        .map(|(symbol, sim)| {
                            sim.step(&mut rng);
                            sim.to_tick(symbol, &mut rng)
                        })
                        .collect()
                };

                for tick in ticks {
                    if events.send(FeedEvent::Tick(tick)).await.is_err() {
                        info!("Simulated feed stopped");
                        return;
                    }
                }
            }
        });

        (Arc::new(Self { active }), handle)
    }

    /// Symbols currently being generated
    pub fn active_symbols(&self) -> Vec<Symbol> {
        self.active.lock().keys().cloned().collect()
    }
}

impl FeedAdapter for SimulatedFeed {
    fn start_feed(&self, symbol: &Symbol) -> Result<()> {
        self.active
            .lock()
            .entry(symbol.clone())
            .or_insert_with(|| SimState::new(symbol));
        debug!(symbol = %symbol, "Simulating symbol");
        Ok(())
    }

    fn stop_feed(&self, symbol: &Symbol) -> Result<()> {
        self.active.lock().remove(symbol);
        Ok(())
    }
}
