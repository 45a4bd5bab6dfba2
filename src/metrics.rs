//! Prometheus metrics for the distribution path

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{Result, StreamError};

/// Counters and gauges owned by one running stream
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub ticks_received: IntCounter,
    pub ticks_ignored: IntCounter,
    pub callback_failures: IntCounter,
    pub callbacks_evicted: IntCounter,
    pub connection_write_failures: IntCounter,
    pub connections_evicted: IntCounter,
    pub messages_dropped: IntCounter,
    pub active_connections: IntGauge,
    pub feed_up: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("market_stream".to_string()), None)?;

        let metrics = Self {
            ticks_received: IntCounter::new("ticks_received_total", "Ticks accepted from the feed")?,
            ticks_ignored: IntCounter::new(
                "ticks_ignored_total",
                "Ticks dropped because their symbol is not subscribed",
            )?,
            callback_failures: IntCounter::new(
                "callback_failures_total",
                "Callback invocations that returned an error or panicked",
            )?,
            callbacks_evicted: IntCounter::new(
                "callbacks_evicted_total",
                "Callbacks removed for lagging or having stopped",
            )?,
            connection_write_failures: IntCounter::new(
                "connection_write_failures_total",
                "Writes to dashboard connections that failed or timed out",
            )?,
            connections_evicted: IntCounter::new(
                "connections_evicted_total",
                "Dashboard connections removed by the broadcaster",
            )?,
            messages_dropped: IntCounter::new(
                "messages_dropped_total",
                "Messages dropped because a consumer queue was full",
            )?,
            active_connections: IntGauge::new("active_connections", "Active dashboard connections")?,
            feed_up: IntGauge::new("feed_up", "1 while the upstream feed is connected")?,
            registry,
        };

        metrics.registry.register(Box::new(metrics.ticks_received.clone()))?;
        metrics.registry.register(Box::new(metrics.ticks_ignored.clone()))?;
        metrics.registry.register(Box::new(metrics.callback_failures.clone()))?;
        metrics.registry.register(Box::new(metrics.callbacks_evicted.clone()))?;
        metrics
            .registry
            .register(Box::new(metrics.connection_write_failures.clone()))?;
        metrics.registry.register(Box::new(metrics.connections_evicted.clone()))?;
        metrics.registry.register(Box::new(metrics.messages_dropped.clone()))?;
        metrics.registry.register(Box::new(metrics.active_connections.clone()))?;
        metrics.registry.register(Box::new(metrics.feed_up.clone()))?;

        Ok(metrics)
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| StreamError::Metrics(e.to_string()))
    }
}
