//! Tick dispatcher
//!
//! The single funnel every tick passes through: cache update, callback
//! fan-out, then broadcast to dashboard connections. All three steps are
//! in-memory and non-blocking, so the feed is never stalled by a consumer.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, trace, warn};

use crate::broadcast::ConnectionManager;
use crate::cache::LatestValueCache;
use crate::error::{Result, StreamError};
use crate::feed::{FeedEvent, FeedStatus};
use crate::metrics::Metrics;
use crate::registry::{Offer, SubscriptionId, SubscriptionRegistry};
use crate::tick::Tick;

/// What happened to one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Symbol not subscribed; nothing was touched
    Ignored,
    Delivered {
        callbacks: usize,
        connections: usize,
    },
}

pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<LatestValueCache>,
    connections: Arc<ConnectionManager>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<LatestValueCache>,
        connections: Arc<ConnectionManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            cache,
            connections,
            metrics,
        }
    }

    /// Process one tick from the feed
    pub fn on_tick(&self, tick: Tick) -> DispatchOutcome {
        let max_lagged = self.registry.max_lagged();

        // Cache update, callback offers and the connection broadcast all
        // happen under the registry read lock, so an unsubscribe either fully
        // precedes or fully follows them.
        let routed = self.registry.route(tick.symbol.as_str(), |slots| {
            self.cache.update(tick.clone());
            let offers = slots
                .iter()
                .map(|slot| (slot.id(), slot.offer(&tick, max_lagged)))
                .collect::<Vec<(SubscriptionId, Offer)>>();
            (offers, self.connections.broadcast(&tick))
        });

        let Some((offers, report)) = routed else {
            self.metrics.ticks_ignored.inc();
            trace!(symbol = %tick.symbol, "Dropping tick for inactive symbol");
            return DispatchOutcome::Ignored;
        };
        self.metrics.ticks_received.inc();

        let mut callbacks = 0;
        for (id, offer) in offers {
            match offer {
                Offer::Queued => callbacks += 1,
                Offer::Dropped => {
                    self.metrics.messages_dropped.inc();
                    warn!(symbol = %tick.symbol, subscription_id = id, "Callback queue full, tick dropped");
                }
                Offer::Evict => self.registry.evict_callback(tick.symbol.as_str(), id),
            }
        }

        DispatchOutcome::Delivered {
            callbacks,
            connections: report.delivered,
        }
    }

    /// Consume feed events until the adapter goes away.
    ///
    /// Loss of the upstream connection is recorded in `status` while cached
    /// values keep being served. The end of the event stream itself is
    /// returned as `FeedUnavailable`.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<FeedEvent>,
        status: &watch::Sender<FeedStatus>,
    ) -> Result<()> {
        info!("Dispatcher started");

        while let Some(event) = events.recv().await {
            match event {
                FeedEvent::Tick(tick) => {
                    self.on_tick(tick);
                }
                FeedEvent::Unavailable(reason) => {
                    let failure = StreamError::FeedUnavailable(reason.clone());
                    error!(error = %failure, "Feed lost, serving last known values");
                    self.metrics.feed_up.set(0);
                    status.send_replace(FeedStatus::unavailable(reason));
                }
                FeedEvent::Restored => {
                    info!("Feed connected");
                    self.metrics.feed_up.set(1);
                    status.send_replace(FeedStatus::Connected);
                }
            }
        }

        warn!("Feed event stream ended");
        self.metrics.feed_up.set(0);
        status.send_replace(FeedStatus::unavailable("feed adapter stopped"));
        Err(StreamError::FeedUnavailable(
            "feed event stream ended".to_string(),
        ))
    }
}
