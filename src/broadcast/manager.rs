//! Connection manager
//!
//! Every connection owns a bounded queue drained by its own writer task. The
//! broadcast path only performs non-blocking queue offers under the set lock,
//! so a slow client never holds up the others or the dispatcher.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connection::{
    run_writer, ClientSink, ConnectionId, ConnectionMap, ConnectionSlot, ConnectionState,
    Outbound, StateCell, WriterContext,
};
use crate::cache::LatestValueCache;
use crate::metrics::Metrics;
use crate::tick::Tick;

/// Outcome of one fan-out pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the message was queued for
    pub delivered: usize,
    /// Connections whose queue was full
    pub dropped: usize,
    /// Connections removed during this pass
    pub evicted: Vec<ConnectionId>,
}

impl BroadcastReport {
    fn merge(&mut self, other: BroadcastReport) {
        self.delivered = self.delivered.max(other.delivered);
        self.dropped += other.dropped;
        self.evicted.extend(other.evicted);
    }
}

/// Owns the set of live dashboard connections
pub struct ConnectionManager {
    connections: ConnectionMap,
    cache: Arc<LatestValueCache>,
    metrics: Arc<Metrics>,
    next_id: AtomicU64,
    queue_capacity: usize,
    write_timeout: Duration,
    max_lagged: u32,
}

impl ConnectionManager {
    pub fn new(
        cache: Arc<LatestValueCache>,
        metrics: Arc<Metrics>,
        queue_capacity: usize,
        write_timeout: Duration,
        max_lagged: u32,
    ) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            cache,
            metrics,
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            write_timeout,
            max_lagged: max_lagged.max(1),
        }
    }

    /// Activate a connection and queue the current snapshot as its first frames.
    ///
    /// The snapshot is taken while holding the connection set lock, so any
    /// tick cached after it is guaranteed to reach this client through
    /// `broadcast` afterwards.
    pub fn register<S: ClientSink>(&self, sink: S, peer: impl Into<String>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = peer.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let state = Arc::new(StateCell::new());

        tokio::spawn(run_writer(
            sink,
            rx,
            WriterContext {
                id,
                state: state.clone(),
                connections: self.connections.clone(),
                write_timeout: self.write_timeout,
                metrics: self.metrics.clone(),
            },
        ));

        let (snapshot_len, active) = {
            let mut connections = self.connections.lock();

            let snapshot: Vec<Arc<str>> = self
                .cache
                .snapshot()
                .values()
                .filter_map(encode)
                .collect();
            let snapshot_len = snapshot.len();

            if !snapshot.is_empty() && tx.try_send(Outbound::Batch(snapshot)).is_err() {
                warn!(connection_id = id, "Could not queue initial snapshot");
            }

            state.set(ConnectionState::Active);
            connections.insert(
                id,
                ConnectionSlot {
                    tx,
                    state,
                    peer: peer.clone(),
                    lagged: 0,
                },
            );
            (snapshot_len, connections.len())
        };

        self.metrics.active_connections.inc();
        info!(
            connection_id = id,
            peer = %peer,
            snapshot = snapshot_len,
            active,
            "Connection registered"
        );
        id
    }

    /// Push a tick to every active connection
    pub fn broadcast(&self, tick: &Tick) -> BroadcastReport {
        let Some(frame) = encode(tick) else {
            return BroadcastReport::default();
        };

        let mut connections = self.connections.lock();
        self.fan_out(&mut connections, Outbound::Text(frame))
    }

    /// Liveness pass: re-push ticks that have been quiet for `quiet_for`,
    /// then ping every client.
    pub fn heartbeat(&self, quiet_for: Duration) -> BroadcastReport {
        let mut connections = self.connections.lock();
        if connections.is_empty() {
            return BroadcastReport::default();
        }

        let quiet: Vec<Arc<str>> = self
            .cache
            .quiet_since(quiet_for)
            .iter()
            .filter_map(encode)
            .collect();

        let mut report = BroadcastReport::default();
        if !quiet.is_empty() {
            report = self.fan_out(&mut connections, Outbound::Batch(quiet));
        }
        report.merge(self.fan_out(&mut connections, Outbound::Ping));
        report
    }

    /// Explicitly remove a connection. Removing twice is a no-op.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.lock().remove(&id);

        match removed {
            Some(slot) => {
                slot.state.set(ConnectionState::Closed);
                self.metrics.active_connections.dec();
                info!(connection_id = id, peer = %slot.peer, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Close every connection, returning how many were active
    pub fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, ConnectionSlot)> =
            self.connections.lock().drain().collect();

        for (_, slot) in &drained {
            slot.state.set(ConnectionState::Closed);
        }
        self.metrics.active_connections.sub(drained.len() as i64);

        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all connections");
        }
        drained.len()
    }

    /// Current state; connections no longer in the set are `Closed`
    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections
            .lock()
            .get(&id)
            .map(|slot| slot.state.get())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run `heartbeat` every `period` until the task is aborted
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = manager.heartbeat(period);
                if !report.evicted.is_empty() {
                    debug!(evicted = ?report.evicted, "Heartbeat evicted connections");
                }
            }
        })
    }

    /// Offer one message to every connection, evicting closed or
    /// persistently lagging ones in the same pass.
    fn fan_out(
        &self,
        connections: &mut HashMap<ConnectionId, ConnectionSlot>,
        message: Outbound,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        connections.retain(|id, slot| {
            if slot.state.get() == ConnectionState::Closed {
                report.evicted.push(*id);
                return false;
            }

            match slot.tx.try_send(message.clone()) {
                Ok(()) => {
                    slot.lagged = 0;
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    slot.lagged += 1;
                    report.dropped += 1;
                    self.metrics.messages_dropped.inc();

                    if slot.lagged >= self.max_lagged {
                        warn!(
                            connection_id = *id,
                            peer = %slot.peer,
                            lagged = slot.lagged,
                            "Evicting lagging connection"
                        );
                        slot.state.set(ConnectionState::Closed);
                        report.evicted.push(*id);
                        false
                    } else {
                        true
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    slot.state.set(ConnectionState::Closed);
                    report.evicted.push(*id);
                    false
                }
            }
        });

        if !report.evicted.is_empty() {
            let evicted = report.evicted.len();
            self.metrics.connections_evicted.inc_by(evicted as u64);
            self.metrics.active_connections.sub(evicted as i64);
        }

        report
    }
}

fn encode(tick: &Tick) -> Option<Arc<str>> {
    match tick.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!(symbol = %tick.symbol, error = %e, "Failed to encode tick");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StreamError};
    use crate::tick::Symbol;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::{sleep, timeout};

    struct RecordingSink(UnboundedSender<String>);

    #[async_trait]
    impl ClientSink for RecordingSink {
        async fn send_text(&mut self, text: &str) -> Result<()> {
            let _ = self.0.send(text.to_string());
            Ok(())
        }

        async fn send_ping(&mut self) -> Result<()> {
            let _ = self.0.send("<ping>".to_string());
            Ok(())
        }

        async fn close(&mut self) {
            let _ = self.0.send("<closed>".to_string());
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ClientSink for FailingSink {
        async fn send_text(&mut self, _text: &str) -> Result<()> {
            Err(StreamError::Transport("broken pipe".to_string()))
        }

        async fn send_ping(&mut self) -> Result<()> {
            self.send_text("").await
        }

        async fn close(&mut self) {}
    }

    struct StallingSink;

    #[async_trait]
    impl ClientSink for StallingSink {
        async fn send_text(&mut self, _text: &str) -> Result<()> {
            std::future::pending().await
        }

        async fn send_ping(&mut self) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) {}
    }

    fn manager_with(
        cache: Arc<LatestValueCache>,
        capacity: usize,
        write_timeout: Duration,
    ) -> ConnectionManager {
        let metrics = Arc::new(Metrics::new().unwrap());
        ConnectionManager::new(cache, metrics, capacity, write_timeout, 2)
    }

    fn manager() -> ConnectionManager {
        manager_with(Arc::new(LatestValueCache::new()), 16, Duration::from_secs(1))
    }

    fn recording() -> (RecordingSink, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (RecordingSink(tx), rx)
    }

    fn tick(symbol: &str, last: rust_decimal::Decimal) -> Tick {
        Tick {
            last: Some(last),
            ..Tick::new(Symbol::parse(symbol).unwrap())
        }
    }

    async fn next_frame(rx: &mut UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within a second")
            .expect("sink open")
    }

    async fn wait_for_count(manager: &ConnectionManager, expected: usize) {
        timeout(Duration::from_secs(1), async {
            while manager.connection_count() != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection count settles");
    }

    #[tokio::test]
    async fn test_failed_write_evicts_only_that_connection() {
        let manager = manager();
        let (sink, mut c1_frames) = recording();
        let c1 = manager.register(sink, "c1");
        let c2 = manager.register(FailingSink, "c2");
        assert_eq!(manager.state(c2), ConnectionState::Active);

        let first = tick("AAPL", dec!(150.25));
        manager.broadcast(&first);

        let received: Tick = serde_json::from_str(&next_frame(&mut c1_frames).await).unwrap();
        assert_eq!(received, first);

        wait_for_count(&manager, 1).await;
        assert_eq!(manager.state(c2), ConnectionState::Closed);
        assert_eq!(manager.connection_ids(), vec![c1]);

        let report = manager.broadcast(&tick("AAPL", dec!(150.50)));
        assert_eq!(report.delivered, 1);
        let received: Tick = serde_json::from_str(&next_frame(&mut c1_frames).await).unwrap();
        assert_eq!(received.last, Some(dec!(150.50)));
    }

    #[tokio::test]
    async fn test_new_connection_receives_snapshot_first() {
        let cache = Arc::new(LatestValueCache::new());
        cache.update(tick("TSLA", dec!(245.80)));
        cache.update(tick("AAPL", dec!(150.25)));
        let manager = manager_with(cache, 16, Duration::from_secs(1));

        let (sink, mut frames) = recording();
        manager.register(sink, "dashboard");
        manager.broadcast(&tick("AAPL", dec!(151)));

        let symbols: Vec<String> = [
            next_frame(&mut frames).await,
            next_frame(&mut frames).await,
            next_frame(&mut frames).await,
        ]
        .iter()
        .map(|frame| serde_json::from_str::<Tick>(frame).unwrap().symbol.to_string())
        .collect();

        assert_eq!(symbols, vec!["AAPL", "TSLA", "AAPL"]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_stops_delivery() {
        let manager = manager();
        let (sink, mut frames) = recording();
        let id = manager.register(sink, "c1");

        assert!(manager.remove(id));
        assert!(!manager.remove(id));
        assert_eq!(manager.state(id), ConnectionState::Closed);

        let report = manager.broadcast(&tick("AAPL", dec!(1)));
        assert_eq!(report.delivered, 0);
        assert_eq!(next_frame(&mut frames).await, "<closed>");
    }

    #[tokio::test]
    async fn test_lagging_connection_is_evicted() {
        // Capacity 1 and no yield between offers: the writer never drains.
        let manager = manager_with(Arc::new(LatestValueCache::new()), 1, Duration::from_secs(60));
        let id = manager.register(StallingSink, "slow");

        assert_eq!(manager.broadcast(&tick("AAPL", dec!(1))).delivered, 1);

        let second = manager.broadcast(&tick("AAPL", dec!(2)));
        assert_eq!(second.dropped, 1);
        assert!(second.evicted.is_empty());

        let third = manager.broadcast(&tick("AAPL", dec!(3)));
        assert_eq!(third.evicted, vec![id]);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_write_timeout_evicts_connection() {
        let manager = manager_with(
            Arc::new(LatestValueCache::new()),
            16,
            Duration::from_millis(20),
        );
        let (sink, mut frames) = recording();
        manager.register(sink, "fast");
        manager.register(StallingSink, "stalled");

        manager.broadcast(&tick("AAPL", dec!(1)));

        wait_for_count(&manager, 1).await;
        assert!(next_frame(&mut frames).await.contains("AAPL"));
    }

    #[tokio::test]
    async fn test_heartbeat_repushes_quiet_ticks_and_pings() {
        let cache = Arc::new(LatestValueCache::new());
        cache.update(tick("AAPL", dec!(150.25)));
        let manager = manager_with(cache, 16, Duration::from_secs(1));

        let (sink, mut frames) = recording();
        manager.register(sink, "c1");
        assert!(next_frame(&mut frames).await.contains("AAPL"));

        let report = manager.heartbeat(Duration::ZERO);
        assert_eq!(report.delivered, 1);
        assert!(next_frame(&mut frames).await.contains("AAPL"));
        assert_eq!(next_frame(&mut frames).await, "<ping>");
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = manager();
        let (sink, mut frames) = recording();
        manager.register(sink, "c1");
        manager.register(StallingSink, "c2");

        assert_eq!(manager.close_all(), 2);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(next_frame(&mut frames).await, "<closed>");
    }
}
