//! Feed adapter actor
//!
//! Each venue gets one task that owns its `SubscriptionSet` and socket.
//! Callers only talk to it through `FeedHandle`. Subscriptions are tracked
//! independently of the socket, so a reconnect re-issues every desired
//! stream.

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ingest_message, RequestAck, SubscriptionKey, SubscriptionSet, Venue};
use crate::store::{self, BarStore};
use crate::types::{Timeframe, WsMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum FeedCommand {
    Subscribe(SubscriptionKey),
    BatchSubscribe(Vec<SubscriptionKey>),
    Unsubscribe(SubscriptionKey),
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Fixed backoff between connection attempts
    pub reconnect: Duration,
    /// Delay between subscribe batches
    pub batch_delay: Duration,
    pub ping_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect: Duration::from_secs(5),
            batch_delay: Duration::from_millis(250),
            ping_interval: Duration::from_secs(20),
        }
    }
}

/// Cloneable handle to a running feed adapter
#[derive(Clone)]
pub struct FeedHandle {
    venue: &'static str,
    commands: mpsc::UnboundedSender<FeedCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl FeedHandle {
    pub fn venue(&self) -> &'static str {
        self.venue
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self, symbol: &str, timeframe: Timeframe) -> Result<()> {
        self.send(FeedCommand::Subscribe(SubscriptionKey::new(symbol, timeframe)))
    }

    pub fn batch_subscribe(&self, pairs: &[(String, Timeframe)]) -> Result<()> {
        let keys = pairs
            .iter()
            .map(|(symbol, timeframe)| SubscriptionKey::new(symbol, *timeframe))
            .collect();
        self.send(FeedCommand::BatchSubscribe(keys))
    }

    pub fn unsubscribe(&self, symbol: &str, timeframe: Timeframe) -> Result<()> {
        self.send(FeedCommand::Unsubscribe(SubscriptionKey::new(symbol, timeframe)))
    }

    fn send(&self, command: FeedCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("{} feed adapter has stopped", self.venue))
    }
}

/// Start the adapter task for `venue`. The socket is opened lazily on the
/// first subscription.
pub fn spawn_feed(
    venue: Arc<dyn Venue>,
    store: Arc<dyn BarStore>,
    tx: broadcast::Sender<WsMessage>,
    config: FeedConfig,
) -> (FeedHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let handle = FeedHandle {
        venue: venue.name(),
        commands: cmd_tx,
        state: state_rx,
    };

    let adapter = FeedAdapter {
        venue,
        store,
        tx,
        config,
        subs: SubscriptionSet::new(),
        commands: cmd_rx,
        state: state_tx,
        request_id: 0,
        inflight: HashMap::new(),
    };

    (handle, tokio::spawn(adapter.run()))
}

enum SessionEnd {
    /// Socket dropped; reconnect
    Lost,
    /// Every handle dropped; stop the task
    Shutdown,
}

struct FeedAdapter {
    venue: Arc<dyn Venue>,
    store: Arc<dyn BarStore>,
    tx: broadcast::Sender<WsMessage>,
    config: FeedConfig,
    subs: SubscriptionSet,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    state: watch::Sender<ConnectionState>,
    request_id: u64,
    /// Subscribe batches sent on this connection and not yet acknowledged
    inflight: HashMap<u64, Vec<SubscriptionKey>>,
}

impl FeedAdapter {
    async fn run(mut self) {
        let venue = self.venue.name();
        let mut attempt: u64 = 0;

        loop {
            // Stay disconnected until there is something to subscribe to
            while self.subs.desired_len() == 0 {
                match self.commands.recv().await {
                    Some(command) => self.apply(command),
                    None => return,
                }
            }

            attempt = attempt.wrapping_add(1);
            self.set_state(ConnectionState::Connecting);
            info!(venue, attempt, url = self.venue.ws_url(), "Connecting feed");

            match tokio_tungstenite::connect_async(self.venue.ws_url()).await {
                Ok((stream, _)) => {
                    info!(venue, attempt, pending = self.subs.pending_len(), "Feed connected");
                    self.set_state(ConnectionState::Connected);
                    if let SessionEnd::Shutdown = self.session(stream).await {
                        self.set_state(ConnectionState::Disconnected);
                        info!(venue, "Feed adapter stopped");
                        return;
                    }
                }
                Err(e) => warn!(venue, attempt, "Feed connect failed: {}", e),
            }

            self.subs.on_disconnect();
            self.set_state(ConnectionState::Reconnecting);
            debug!(
                venue,
                resubscribe = self.subs.pending_len(),
                "Reconnecting in {:?}",
                self.config.reconnect
            );

            // Keep accepting commands during the backoff
            let backoff = tokio::time::sleep(self.config.reconnect);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = &mut backoff => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.apply(command),
                        None => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    },
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    fn apply(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::Subscribe(key) => {
                self.subs.request(key);
            }
            FeedCommand::BatchSubscribe(keys) => {
                for key in keys {
                    self.subs.request(key);
                }
            }
            FeedCommand::Unsubscribe(key) => {
                self.subs.remove(&key);
            }
        }
    }

    async fn session(&mut self, stream: WsStream) -> SessionEnd {
        let venue = self.venue.name();
        let (mut write, mut read) = stream.split();
        self.inflight.clear();

        let mut flush = tokio::time::interval(self.config.batch_delay);
        flush.tick().await; // arm
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await; // arm

        loop {
            tokio::select! {
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            warn!(venue, "Feed read error: {}", e);
                            return SessionEnd::Lost;
                        }
                        None => {
                            warn!(venue, "Feed stream ended");
                            return SessionEnd::Lost;
                        }
                    };
                    match msg {
                        Message::Text(txt) => self.handle_text(txt.as_str()).await,
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            info!(venue, "Feed closed by venue: {:?}", frame);
                            return SessionEnd::Lost;
                        }
                        _ => {}
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(FeedCommand::Unsubscribe(key)) => {
                            if self.subs.remove(&key) {
                                let id = self.next_request_id();
                                let msg = self.venue.unsubscribe_message(std::slice::from_ref(&key), id);
                                if let Err(e) = write.send(Message::Text(msg.into())).await {
                                    warn!(venue, "Feed unsubscribe send failed: {}", e);
                                    return SessionEnd::Lost;
                                }
                            }
                        }
                        Some(command) => self.apply(command),
                        None => {
                            let _ = write.close().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                _ = flush.tick(), if self.subs.pending_len() > 0 => {
                    let batch = self.subs.take_pending(self.venue.max_batch());
                    if batch.is_empty() {
                        continue;
                    }
                    let id = self.next_request_id();
                    let msg = self.venue.subscribe_message(&batch, id);
                    match write.send(Message::Text(msg.into())).await {
                        Ok(()) => {
                            debug!(venue, id, streams = batch.len(), "Subscribe batch sent");
                            self.record_sent(id, batch);
                        }
                        Err(e) => {
                            // Retried on the next connection
                            warn!(venue, streams = batch.len(), "Subscribe batch failed: {}", e);
                            self.subs.mark_failed(batch);
                            return SessionEnd::Lost;
                        }
                    }
                }
                _ = ping.tick() => {
                    let frame = match self.venue.ping_message() {
                        Some(text) => Message::Text(text.into()),
                        None => Message::Ping(Vec::new().into()),
                    };
                    if let Err(e) = write.send(frame).await {
                        warn!(venue, "Feed ping failed: {}", e);
                        return SessionEnd::Lost;
                    }
                }
            }
        }
    }

    fn record_sent(&mut self, id: u64, batch: Vec<SubscriptionKey>) {
        self.subs.mark_sent(&batch);
        self.inflight.insert(id, batch);
    }

    async fn handle_text(&mut self, text: &str) {
        if let Some(ack) = self.venue.parse_ack(text) {
            self.handle_ack(ack);
            return;
        }

        let (venue, bar_store, tx) = (self.venue.clone(), self.store.clone(), self.tx.clone());
        let text = text.to_string();
        let ingested =
            store::blocking(move || ingest_message(venue.as_ref(), bar_store.as_ref(), &tx, &text)).await;
        if let Err(e) = ingested {
            warn!(venue = self.venue.name(), "Dropping feed message: {:#}", e);
        }
    }

    fn handle_ack(&mut self, ack: RequestAck) {
        match ack {
            RequestAck::Accepted { request_id } => {
                if let Some(id) = request_id {
                    self.inflight.remove(&id);
                }
            }
            RequestAck::Rejected { request_id, reason } => {
                let keys: Vec<SubscriptionKey> = match request_id {
                    Some(id) => self.inflight.remove(&id).unwrap_or_default(),
                    // Unattributed: every unanswered batch is suspect
                    None => self.inflight.drain().flat_map(|(_, keys)| keys).collect(),
                };
                let streams: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{}@{}", k.symbol, k.timeframe))
                    .collect();
                warn!(
                    venue = self.venue.name(),
                    request_id,
                    streams = %streams.join(","),
                    "Subscribe rejected, retrying on reconnect: {}",
                    reason
                );
                self.subs.mark_rejected(&keys);
            }
        }
    }
}
