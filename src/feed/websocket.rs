//! WebSocket feed adapter
//!
//! Keeps one gateway connection alive with automatic reconnection, replays
//! the desired symbol set after every reconnect, and forwards ticks to the
//! dispatcher.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{error::Elapsed, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::protocol::{Action, FeedCommand, ParsedMessage};
use super::{FeedAdapter, FeedEvent, UpstreamClient};
use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::tick::{Symbol, Tick};

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;

const KEEPALIVE_AFTER: Duration = Duration::from_secs(30);
const RECV_TIMEOUT: Duration = Duration::from_secs(45);

/// Handle to the gateway connection task
pub struct WebSocketFeed {
    desired: Arc<Mutex<BTreeSet<Symbol>>>,
    commands: mpsc::UnboundedSender<FeedCommand>,
}

impl WebSocketFeed {
    /// Spawn the connection task. It stops once every handle is dropped or
    /// the reconnect budget is exhausted.
    pub fn spawn(config: &Config, events: mpsc::Sender<FeedEvent>) -> (Arc<Self>, JoinHandle<()>) {
        let desired = Arc::new(Mutex::new(BTreeSet::new()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut connection = FeedConnection {
            client: UpstreamClient::new(&config.feed_endpoint),
            http: reqwest::Client::new(),
            rest_endpoint: config.rest_endpoint.clone(),
            desired: desired.clone(),
            upstream: BTreeSet::new(),
            commands: commands_rx,
            events,
            reconnect_delay_ms: config.reconnect_delay_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_attempts: 0,
            connected_since: None,
        };

        let handle = tokio::spawn(async move { connection.run().await });

        (
            Arc::new(Self {
                desired,
                commands: commands_tx,
            }),
            handle,
        )
    }

    /// Symbols the adapter should be streaming
    pub fn desired_symbols(&self) -> Vec<Symbol> {
        self.desired.lock().iter().cloned().collect()
    }
}

impl FeedAdapter for WebSocketFeed {
    fn start_feed(&self, symbol: &Symbol) -> Result<()> {
        if !self.desired.lock().insert(symbol.clone()) {
            return Ok(());
        }

        if self.commands.send(FeedCommand::subscribe(symbol.clone())).is_err() {
            self.desired.lock().remove(symbol);
            return Err(StreamError::FeedUnavailable(
                "feed connection task has stopped".to_string(),
            ));
        }
        Ok(())
    }

    fn stop_feed(&self, symbol: &Symbol) -> Result<()> {
        if self.desired.lock().remove(symbol)
            && self.commands.send(FeedCommand::unsubscribe(symbol.clone())).is_err()
        {
            debug!(symbol = %symbol, "Feed task already stopped");
        }
        Ok(())
    }
}

enum Flow {
    Reconnect,
    Shutdown,
}

enum Step {
    Command(Option<FeedCommand>),
    Received(std::result::Result<Result<Option<String>>, Elapsed>),
}

/// State owned by the connection task
struct FeedConnection {
    client: UpstreamClient,
    http: reqwest::Client,
    rest_endpoint: Option<String>,
    desired: Arc<Mutex<BTreeSet<Symbol>>>,
    /// Symbols subscribed on the current gateway connection
    upstream: BTreeSet<Symbol>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    events: mpsc::Sender<FeedEvent>,
    reconnect_delay_ms: u64,
    max_reconnect_attempts: u32,
    reconnect_attempts: u32,
    /// Set while a gateway connection is up
    connected_since: Option<Instant>,
}

impl FeedConnection {
    async fn run(&mut self) {
        info!("Starting feed connection with automatic reconnection");

        loop {
            let result = self.connect_and_process().await;
            self.end_of_connection();

            match result {
                Ok(Flow::Shutdown) => {
                    info!("Feed connection shutting down");
                    self.client.close().await;
                    return;
                }
                Ok(Flow::Reconnect) => {
                    info!("Feed processing completed normally, reconnecting...");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    error!(error = %e, "Feed connection error");
                    self.client.close().await;

                    if self
                        .events
                        .send(FeedEvent::Unavailable(e.to_string()))
                        .await
                        .is_err()
                    {
                        info!("Dispatcher gone, stopping feed connection");
                        return;
                    }

                    self.reconnect_attempts += 1;
                    if self.max_reconnect_attempts > 0
                        && self.reconnect_attempts >= self.max_reconnect_attempts
                    {
                        error!(
                            attempts = self.reconnect_attempts,
                            "Max reconnection attempts exceeded, giving up"
                        );
                        return;
                    }

                    // Exponential backoff, capped at MAX_BACKOFF_MS
                    let base_delay =
                        self.reconnect_delay_ms * 2u64.pow(self.reconnect_attempts.min(6));
                    let delay = Duration::from_millis(base_delay.min(MAX_BACKOFF_MS));

                    warn!(
                        attempt = self.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after error..."
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Reset reconnect attempts only if the connection that just ended
    /// stayed up past the cooldown period
    fn end_of_connection(&mut self) {
        let Some(since) = self.connected_since.take() else {
            return;
        };
        if since.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS) && self.reconnect_attempts > 0 {
            info!(
                previous_attempts = self.reconnect_attempts,
                "Resetting reconnect counter after stable connection"
            );
            self.reconnect_attempts = 0;
        }
    }

    async fn connect_and_process(&mut self) -> Result<Flow> {
        self.client.connect().await?;

        self.connected_since = Some(Instant::now());
        self.upstream.clear();

        // Queued commands are superseded by replaying the desired set
        loop {
            match self.commands.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(Flow::Shutdown),
            }
        }

        let desired: Vec<Symbol> = self.desired.lock().iter().cloned().collect();
        for symbol in desired {
            self.apply_command(FeedCommand::subscribe(symbol)).await?;
        }

        if self.events.send(FeedEvent::Restored).await.is_err() {
            return Ok(Flow::Shutdown);
        }

        let mut last_message = Instant::now();

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                received = timeout(RECV_TIMEOUT, self.client.recv()) => Step::Received(received),
            };

            match step {
                Step::Command(None) => return Ok(Flow::Shutdown),
                Step::Command(Some(command)) => self.apply_command(command).await?,
                Step::Received(Ok(Ok(Some(text)))) => {
                    last_message = Instant::now();
                    match self.process_message(&text).await {
                        Ok(true) => {}
                        Ok(false) => return Ok(Flow::Shutdown),
                        Err(e) => warn!(error = %e, "Failed to process message"),
                    }
                }
                Step::Received(Ok(Ok(None))) => {
                    // Control frame; send keepalive if data has been quiet
                    if last_message.elapsed() > KEEPALIVE_AFTER {
                        if let Err(e) = self.client.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Step::Received(Ok(Err(e))) => return Err(e),
                Step::Received(Err(_)) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = self.client.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(StreamError::ConnectionTimeout);
                    }
                }
            }
        }
    }

    /// Send a command unless the gateway already has that state
    async fn apply_command(&mut self, command: FeedCommand) -> Result<()> {
        let changed = match command.action {
            Action::Subscribe => self.upstream.insert(command.symbol.clone()),
            Action::Unsubscribe => self.upstream.remove(&command.symbol),
        };
        if !changed {
            return Ok(());
        }

        self.client.send_json(&command).await?;
        debug!(symbol = %command.symbol, action = ?command.action, "Sent feed command");

        if command.action == Action::Subscribe {
            self.seed_from_rest(&command.symbol).await;
        }
        Ok(())
    }

    /// Process one gateway message. Returns `false` once the dispatcher is gone.
    async fn process_message(&self, raw: &str) -> Result<bool> {
        match ParsedMessage::parse(raw)? {
            ParsedMessage::Tick(tick) => {
                if !self.desired.lock().contains(&tick.symbol) {
                    trace!(symbol = %tick.symbol, "Tick for unrequested symbol");
                    return Ok(true);
                }
                Ok(self.events.send(FeedEvent::Tick(tick)).await.is_ok())
            }
            ParsedMessage::Error(err) if err.fatal => {
                error!(code = ?err.code, message = %err.message, "Gateway reported fatal error");
                Ok(self
                    .events
                    .send(FeedEvent::Unavailable(err.message))
                    .await
                    .is_ok())
            }
            ParsedMessage::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "Gateway error");
                Ok(true)
            }
            ParsedMessage::Heartbeat => {
                trace!("Gateway heartbeat");
                Ok(true)
            }
            ParsedMessage::Unknown(msg) => {
                trace!(msg = %msg, "Unknown message type");
                Ok(true)
            }
        }
    }

    /// Fetch an initial quote so a new symbol has data before its first tick
    async fn seed_from_rest(&self, symbol: &Symbol) {
        let Some(rest_endpoint) = &self.rest_endpoint else {
            return;
        };

        let url = format!("{}/quote?symbol={}", rest_endpoint, symbol);
        info!(symbol = %symbol, url = %url, "Fetching quote snapshot");

        match self.fetch_quote(&url).await {
            Ok(tick) if tick.symbol == *symbol => {
                let _ = self.events.send(FeedEvent::Tick(tick)).await;
            }
            Ok(tick) => {
                warn!(expected = %symbol, got = %tick.symbol, "Quote snapshot for wrong symbol");
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "Quote snapshot failed"),
        }
    }

    async fn fetch_quote(&self, url: &str) -> Result<Tick> {
        let tick = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Tick>()
            .await?;
        Ok(tick)
    }
}
