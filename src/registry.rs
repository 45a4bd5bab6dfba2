//! Subscription registry
//!
//! Tracks which symbols are active and which callbacks are registered for
//! each. Every callback gets a bounded queue and a dedicated worker task, so
//! delivery from the dispatcher is a non-blocking queue offer.

use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::cache::LatestValueCache;
use crate::error::StreamError;
use crate::handler::TickHandler;
use crate::metrics::Metrics;
use crate::tick::{Symbol, Tick};

pub type SubscriptionId = u64;

/// Token returned from `subscribe`, naming the exact callback it registered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub symbol: Symbol,
    /// `None` when the subscription carried no callback
    pub id: Option<SubscriptionId>,
}

/// Result of unsubscribing a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Removed { callbacks: usize },
    NotSubscribed,
}

/// Result of offering a tick to one consumer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    Queued,
    /// Queue full, tick dropped for this consumer only
    Dropped,
    /// Consumer is gone or has lagged too long
    Evict,
}

/// One registered callback as seen by the dispatcher
pub(crate) struct CallbackSlot {
    id: SubscriptionId,
    tx: mpsc::Sender<Tick>,
    active: Arc<AtomicBool>,
    lagged: AtomicU32,
}

impl CallbackSlot {
    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn offer(&self, tick: &Tick, max_lagged: u32) -> Offer {
        match self.tx.try_send(tick.clone()) {
            Ok(()) => {
                self.lagged.store(0, Ordering::Relaxed);
                Offer::Queued
            }
            Err(TrySendError::Full(_)) => {
                let lagged = self.lagged.fetch_add(1, Ordering::Relaxed) + 1;
                if lagged >= max_lagged {
                    Offer::Evict
                } else {
                    Offer::Dropped
                }
            }
            Err(TrySendError::Closed(_)) => Offer::Evict,
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Symbol → callbacks mapping
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<Symbol, Vec<CallbackSlot>>>,
    cache: Arc<LatestValueCache>,
    metrics: Arc<Metrics>,
    next_id: AtomicU64,
    queue_capacity: usize,
    max_lagged: u32,
}

impl SubscriptionRegistry {
    pub fn new(
        cache: Arc<LatestValueCache>,
        metrics: Arc<Metrics>,
        queue_capacity: usize,
        max_lagged: u32,
    ) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            cache,
            metrics,
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            max_lagged: max_lagged.max(1),
        }
    }

    /// Start tracking `symbol`, optionally registering a callback.
    ///
    /// Returns the handle and whether the symbol became active with this
    /// call. Registering a callback spawns its worker, so it must run inside
    /// a tokio runtime.
    pub fn subscribe(
        &self,
        symbol: Symbol,
        handler: Option<Arc<dyn TickHandler>>,
    ) -> (SubscriptionHandle, bool) {
        let slot = handler.map(|handler| self.spawn_worker(&symbol, handler));
        let id = slot.as_ref().map(|slot| slot.id);

        let newly_active = {
            let mut subscriptions = self.subscriptions.write();
            let newly_active = !subscriptions.contains_key(&symbol);
            let slots = subscriptions.entry(symbol.clone()).or_default();
            if let Some(slot) = slot {
                slots.push(slot);
            }
            newly_active
        };

        info!(symbol = %symbol, subscription_id = ?id, newly_active, "Subscribed");
        (SubscriptionHandle { symbol, id }, newly_active)
    }

    /// Remove every callback for `symbol` and evict its cached tick
    pub fn unsubscribe(&self, symbol: &str) -> UnsubscribeOutcome {
        let mut subscriptions = self.subscriptions.write();

        match subscriptions.remove(symbol) {
            Some(slots) => {
                for slot in &slots {
                    slot.deactivate();
                }
                // Evicted under the registry lock so a concurrent dispatch
                // cannot re-insert the entry.
                self.cache.evict(symbol);
                info!(symbol = %symbol, callbacks = slots.len(), "Unsubscribed");
                UnsubscribeOutcome::Removed {
                    callbacks: slots.len(),
                }
            }
            None => {
                debug!(symbol = %symbol, "Unsubscribe for inactive symbol ignored");
                UnsubscribeOutcome::NotSubscribed
            }
        }
    }

    /// Remove exactly the callback named by `handle`. The symbol stays active.
    pub fn cancel(&self, handle: &SubscriptionHandle) -> bool {
        match handle.id {
            Some(id) => self.remove_callback(handle.symbol.as_str(), id),
            None => false,
        }
    }

    /// Drop a callback the dispatcher found closed or lagging
    pub(crate) fn evict_callback(&self, symbol: &str, id: SubscriptionId) {
        if self.remove_callback(symbol, id) {
            self.metrics.callbacks_evicted.inc();
            warn!(symbol = %symbol, subscription_id = id, "Evicted unresponsive callback");
        }
    }

    /// Run `f` over the callbacks of an active symbol while holding the
    /// registry read lock. Returns `None` if the symbol is not active.
    pub(crate) fn route<R>(&self, symbol: &str, f: impl FnOnce(&[CallbackSlot]) -> R) -> Option<R> {
        let subscriptions = self.subscriptions.read();
        subscriptions.get(symbol).map(|slots| f(slots.as_slice()))
    }

    /// Unsubscribe everything, returning the symbols that were active
    pub fn clear(&self) -> Vec<Symbol> {
        let mut subscriptions = self.subscriptions.write();
        let mut symbols = Vec::with_capacity(subscriptions.len());

        for (symbol, slots) in subscriptions.drain() {
            for slot in &slots {
                slot.deactivate();
            }
            self.cache.evict(symbol.as_str());
            symbols.push(symbol);
        }

        symbols.sort();
        symbols
    }

    pub fn active_symbols(&self) -> BTreeSet<Symbol> {
        self.subscriptions.read().keys().cloned().collect()
    }

    pub fn is_active(&self, symbol: &str) -> bool {
        self.subscriptions.read().contains_key(symbol)
    }

    pub fn callback_count(&self, symbol: &str) -> usize {
        self.subscriptions
            .read()
            .get(symbol)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }

    pub(crate) fn max_lagged(&self) -> u32 {
        self.max_lagged
    }

    fn remove_callback(&self, symbol: &str, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let Some(slots) = subscriptions.get_mut(symbol) else {
            return false;
        };

        match slots.iter().position(|slot| slot.id == id) {
            Some(index) => {
                let slot = slots.remove(index);
                slot.deactivate();
                debug!(symbol = %symbol, subscription_id = id, "Callback removed");
                true
            }
            None => false,
        }
    }

    fn spawn_worker(&self, symbol: &Symbol, handler: Arc<dyn TickHandler>) -> CallbackSlot {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let active = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_callback_worker(
            symbol.clone(),
            id,
            handler,
            rx,
            active.clone(),
            self.metrics.clone(),
        ));

        CallbackSlot {
            id,
            tx,
            active,
            lagged: AtomicU32::new(0),
        }
    }
}

async fn run_callback_worker(
    symbol: Symbol,
    id: SubscriptionId,
    handler: Arc<dyn TickHandler>,
    mut rx: mpsc::Receiver<Tick>,
    active: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
) {
    while let Some(tick) = rx.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }

        match AssertUnwindSafe(handler.on_tick(&tick)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics.callback_failures.inc();
                let failure = StreamError::CallbackFailure {
                    symbol: symbol.to_string(),
                    id,
                    reason: format!("{:#}", e),
                };
                warn!(error = %failure, "Callback returned an error");
            }
            Err(_) => {
                metrics.callback_failures.inc();
                error!(symbol = %symbol, subscription_id = id, "Callback panicked");
            }
        }
    }

    debug!(symbol = %symbol, subscription_id = id, "Callback worker stopped");
}
