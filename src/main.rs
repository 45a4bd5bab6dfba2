//! Market Stream - live market-data fan-out service
//!
//! Connects to the configured feed, keeps the latest tick per symbol and
//! pushes every update to dashboard clients over WebSocket.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_stream::{
    server, Config, FeedAdapter, FeedMode, JsonlRecorder, LoggingHandler, MarketStream, Metrics, SimulatedFeed,
    TickHandler, WebSocketFeed,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Stream");

    // Load configuration
    let config = Config::load()?;
    info!(
        symbols = ?config.symbols,
        feed_mode = ?config.feed_mode,
        bind_address = %config.bind_address,
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new()?);
    let (events_tx, events_rx) = mpsc::channel(config.feed_event_capacity);

    // Start the feed adapter
    let (feed, feed_task): (Arc<dyn FeedAdapter>, JoinHandle<()>) = match config.feed_mode {
        FeedMode::WebSocket => {
            let (feed, task) = WebSocketFeed::spawn(&config, events_tx);
            (feed as Arc<dyn FeedAdapter>, task)
        }
        FeedMode::Simulated => {
            let (feed, task) = SimulatedFeed::spawn(config.simulated_interval(), events_tx);
            (feed as Arc<dyn FeedAdapter>, task)
        }
    };

    let stream = Arc::new(MarketStream::new(&config, feed, metrics));

    let recorder: Option<Arc<dyn TickHandler>> = match &config.record_dir {
        Some(dir) => {
            let recorder = JsonlRecorder::create(dir.clone()).await?;
            Some(Arc::new(recorder) as Arc<dyn TickHandler>)
        }
        None => None,
    };

    for symbol in &config.symbols {
        stream.subscribe(symbol.clone(), recorder.clone())?;
        if config.log_ticks {
            let logger: Arc<dyn TickHandler> = Arc::new(LoggingHandler);
            stream.subscribe(symbol.clone(), Some(logger))?;
        }
    }

    let heartbeat = stream.connections().spawn_heartbeat(config.heartbeat_interval());

    // Dispatch feed events; losing the feed keeps the last values served
    let dispatch_stream = stream.clone();
    let dispatcher = tokio::spawn(async move {
        if let Err(e) = dispatch_stream.run(events_rx).await {
            error!(error = %e, "Ingestion stopped, serving last known values until shutdown");
        }
    });

    let listener = TcpListener::bind(&config.bind_address).await?;
    if let Err(e) = server::serve(listener, stream.clone(), shutdown_signal()).await {
        error!(error = %e, "HTTP server error");
    }

    info!("Shutting down");
    heartbeat.abort();

    if let Some(path) = &config.snapshot_path {
        if let Err(e) = stream.export_snapshot(path).await {
            warn!(error = %e, path = %path.display(), "Snapshot export failed");
        }
    }

    stream.shutdown();
    feed_task.abort();
    dispatcher.abort();

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
