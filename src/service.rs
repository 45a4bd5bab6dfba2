//! Market stream service
//!
//! One `MarketStream` per running process owns the registry, cache,
//! dispatcher, connection manager and feed adapter handle. Every external
//! surface (HTTP routes, WebSocket upgrades, the binary) goes through it.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::broadcast::ConnectionManager;
use crate::cache::LatestValueCache;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::feed::{FeedAdapter, FeedEvent, FeedStatus};
use crate::handler::TickHandler;
use crate::metrics::Metrics;
use crate::persistence;
use crate::registry::{SubscriptionHandle, SubscriptionRegistry, UnsubscribeOutcome};
use crate::tick::{Symbol, Tick};

pub struct MarketStream {
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<LatestValueCache>,
    dispatcher: Dispatcher,
    connections: Arc<ConnectionManager>,
    feed: Arc<dyn FeedAdapter>,
    status: watch::Sender<FeedStatus>,
    metrics: Arc<Metrics>,
    /// Serializes subscribe/unsubscribe so feed start/stop calls follow
    /// registry transitions in order
    lifecycle: Mutex<()>,
}

impl MarketStream {
    pub fn new(config: &Config, feed: Arc<dyn FeedAdapter>, metrics: Arc<Metrics>) -> Self {
        let cache = Arc::new(LatestValueCache::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            cache.clone(),
            metrics.clone(),
            config.callback_queue_capacity,
            config.max_lagged_messages,
        ));
        let connections = Arc::new(ConnectionManager::new(
            cache.clone(),
            metrics.clone(),
            config.client_queue_capacity,
            config.write_timeout(),
            config.max_lagged_messages,
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            cache.clone(),
            connections.clone(),
            metrics.clone(),
        );
        let (status, _) = watch::channel(FeedStatus::Connecting);

        Self {
            registry,
            cache,
            dispatcher,
            connections,
            feed,
            status,
            metrics,
            lifecycle: Mutex::new(()),
        }
    }

    /// Subscribe to `symbol`, optionally with a callback.
    ///
    /// The upstream feed is only asked to start when the symbol becomes
    /// active. If the adapter refuses, the subscription is rolled back and
    /// `FeedUnavailable` is returned.
    pub fn subscribe(
        &self,
        symbol: Symbol,
        handler: Option<Arc<dyn TickHandler>>,
    ) -> Result<SubscriptionHandle> {
        let _guard = self.lifecycle.lock();

        let (handle, newly_active) = self.registry.subscribe(symbol.clone(), handler);
        if newly_active {
            if let Err(e) = self.feed.start_feed(&symbol) {
                error!(symbol = %symbol, error = %e, "Feed refused subscription");
                self.registry.unsubscribe(symbol.as_str());
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Remove every callback for `symbol`, evict its cached tick and stop
    /// the upstream feed. Local removal takes effect even when stopping the
    /// feed fails.
    pub fn unsubscribe(&self, symbol: &Symbol) -> Result<UnsubscribeOutcome> {
        let _guard = self.lifecycle.lock();

        let outcome = self.registry.unsubscribe(symbol.as_str());
        if outcome != UnsubscribeOutcome::NotSubscribed {
            self.feed.stop_feed(symbol)?;
        }
        Ok(outcome)
    }

    /// Remove the single callback named by `handle`
    pub fn cancel(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.cancel(handle)
    }

    /// Latest tick, or `None` when no data has arrived yet
    pub fn latest(&self, symbol: &str) -> Option<Tick> {
        self.cache.get(symbol)
    }

    pub fn snapshot(&self) -> BTreeMap<Symbol, Tick> {
        self.cache.snapshot()
    }

    pub fn active_symbols(&self) -> BTreeSet<Symbol> {
        self.registry.active_symbols()
    }

    pub fn is_active(&self, symbol: &str) -> bool {
        self.registry.is_active(symbol)
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn feed_status(&self) -> FeedStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every feed status change
    pub fn watch_feed(&self) -> watch::Receiver<FeedStatus> {
        self.status.subscribe()
    }

    /// Consume feed events until the adapter stops
    pub async fn run(&self, events: mpsc::Receiver<FeedEvent>) -> Result<()> {
        self.dispatcher.run(events, &self.status).await
    }

    /// Write the latest tick for `symbol` to `path`. Returns `false` and
    /// writes nothing when there is no data yet.
    pub async fn save_latest(&self, symbol: &str, path: &Path) -> Result<bool> {
        match self.cache.get(symbol) {
            Some(tick) => {
                persistence::write_json(&tick, path).await?;
                info!(symbol = %symbol, path = %path.display(), "Saved latest tick");
                Ok(true)
            }
            None => {
                warn!(symbol = %symbol, "No data yet, nothing saved");
                Ok(false)
            }
        }
    }

    /// Write the whole cache snapshot to `path`, returning the entry count
    pub async fn export_snapshot(&self, path: &Path) -> Result<usize> {
        let snapshot = self.cache.snapshot();
        persistence::write_json(&snapshot, path).await?;
        info!(path = %path.display(), symbols = snapshot.len(), "Exported snapshot");
        Ok(snapshot.len())
    }

    /// Close every connection and stop every symbol
    pub fn shutdown(&self) {
        let _guard = self.lifecycle.lock();

        let closed = self.connections.close_all();
        let symbols = self.registry.clear();
        for symbol in &symbols {
            if let Err(e) = self.feed.stop_feed(symbol) {
                warn!(symbol = %symbol, error = %e, "Failed to stop feed");
            }
        }

        info!(
            connections = closed,
            symbols = symbols.len(),
            "Market stream shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::feed::MockFeedAdapter;
    use crate::handler::handler_fn;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    fn symbol(raw: &str) -> Symbol {
        Symbol::parse(raw).unwrap()
    }

    fn stream_with(feed: MockFeedAdapter) -> MarketStream {
        MarketStream::new(
            &Config::default(),
            Arc::new(feed),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    fn priced(raw: &str, last: rust_decimal::Decimal) -> Tick {
        Tick {
            last: Some(last),
            ..Tick::new(symbol(raw))
        }
    }

    #[tokio::test]
    async fn test_feed_started_once_per_symbol() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed()
            .withf(|s| s.as_str() == "AAPL")
            .times(1)
            .returning(|_| Ok(()));
        let stream = stream_with(feed);

        let (tx, mut rx) = unbounded_channel();
        stream.subscribe(symbol("AAPL"), None).unwrap();
        let handle = stream
            .subscribe(
                symbol("AAPL"),
                Some(handler_fn(move |tick| {
                    let _ = tx.send(tick.clone());
                    Ok(())
                })),
            )
            .unwrap();
        assert!(handle.id.is_some());

        stream.dispatcher().on_tick(priced("AAPL", dec!(150.25)));
        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.last, Some(dec!(150.25)));
        assert_eq!(stream.latest("AAPL").unwrap().last, Some(dec!(150.25)));
    }

    #[tokio::test]
    async fn test_feed_refusal_rolls_back() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed()
            .returning(|_| Err(StreamError::FeedUnavailable("gateway down".to_string())));
        let stream = stream_with(feed);

        let result = stream.subscribe(symbol("AAPL"), None);
        assert!(matches!(result, Err(StreamError::FeedUnavailable(_))));
        assert!(!stream.is_active("AAPL"));
        assert!(stream.active_symbols().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_feed_only_when_active() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed().times(1).returning(|_| Ok(()));
        feed.expect_stop_feed()
            .withf(|s| s.as_str() == "TSLA")
            .times(1)
            .returning(|_| Ok(()));
        let stream = stream_with(feed);

        stream.subscribe(symbol("TSLA"), None).unwrap();
        stream.dispatcher().on_tick(priced("TSLA", dec!(245.80)));

        assert_eq!(
            stream.unsubscribe(&symbol("TSLA")).unwrap(),
            UnsubscribeOutcome::Removed { callbacks: 0 }
        );
        assert_eq!(
            stream.unsubscribe(&symbol("TSLA")).unwrap(),
            UnsubscribeOutcome::NotSubscribed
        );
        assert!(stream.latest("TSLA").is_none());
        assert!(stream.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_symbol_active() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed().times(1).returning(|_| Ok(()));
        feed.expect_stop_feed().never();
        let stream = stream_with(feed);

        let handle = stream
            .subscribe(symbol("AAPL"), Some(handler_fn(|_| Ok(()))))
            .unwrap();
        assert!(stream.cancel(&handle));
        assert!(!stream.cancel(&handle));
        assert!(stream.is_active("AAPL"));
    }

    #[tokio::test]
    async fn test_feed_loss_keeps_last_values() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed().returning(|_| Ok(()));
        let stream = stream_with(feed);
        stream.subscribe(symbol("AAPL"), None).unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(FeedEvent::Restored).await.unwrap();
        tx.send(FeedEvent::Tick(priced("AAPL", dec!(150.25)))).await.unwrap();
        tx.send(FeedEvent::Unavailable("connection reset".to_string()))
            .await
            .unwrap();
        drop(tx);

        let mut status = stream.watch_feed();
        let result = stream.run(rx).await;

        assert!(matches!(result, Err(e) if e.is_feed_unavailable()));
        assert!(status.has_changed().unwrap());
        assert!(matches!(
            *status.borrow_and_update(),
            FeedStatus::Unavailable { .. }
        ));
        assert_eq!(stream.latest("AAPL").unwrap().last, Some(dec!(150.25)));
    }

    #[tokio::test]
    async fn test_save_latest_and_export() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed().returning(|_| Ok(()));
        let stream = stream_with(feed);
        let dir = tempdir().unwrap();

        stream.subscribe(symbol("AAPL"), None).unwrap();
        stream.subscribe(symbol("TSLA"), None).unwrap();

        let aapl_path = dir.path().join("AAPL_latest.json");
        assert!(!stream.save_latest("AAPL", &aapl_path).await.unwrap());
        assert!(!aapl_path.exists());

        stream.dispatcher().on_tick(priced("AAPL", dec!(150.25)));
        assert!(stream.save_latest("AAPL", &aapl_path).await.unwrap());
        let saved: Tick = serde_json::from_slice(&std::fs::read(&aapl_path).unwrap()).unwrap();
        assert_eq!(saved.last, Some(dec!(150.25)));

        let snapshot_path = dir.path().join("nested").join("snapshot.json");
        assert_eq!(stream.export_snapshot(&snapshot_path).await.unwrap(), 1);
        let exported: BTreeMap<Symbol, Tick> =
            serde_json::from_slice(&std::fs::read(&snapshot_path).unwrap()).unwrap();
        assert!(exported.contains_key("AAPL"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_symbol() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed().times(2).returning(|_| Ok(()));
        feed.expect_stop_feed().times(2).returning(|_| Ok(()));
        let stream = stream_with(feed);

        assert_ok!(stream.subscribe(symbol("AAPL"), None));
        assert_ok!(stream.subscribe(symbol("TSLA"), None));
        stream.shutdown();

        assert!(stream.active_symbols().is_empty());
        assert_eq!(stream.connections().connection_count(), 0);
    }
}
