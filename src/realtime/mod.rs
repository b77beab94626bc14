//! Realtime event channel
//!
//! Owns one websocket to `/api/realtime/ws` at a time. Reconnects on a fixed
//! interval after a drop, sends a liveness probe while connected, and fans
//! typed events out to subscribers registered by event type.
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          |                    |
//!      +------- failure ----------+---- close/error ---+
//! ```
//!
//! Leaving `Connected` (or failing to get there) starts the reconnect loop
//! unless one is already running. `disconnect()` stops everything until the
//! next `connect()`.

pub mod envelope;
pub mod registry;
pub mod socket;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use url::Url;

use crate::config::Config;
use envelope::{Inbound, PING_FRAME};
use registry::{Handler, SubscriberRegistry, Subscription};
use socket::Frame;

/// Realtime endpoint path on the backend origin.
pub const REALTIME_PATH: &str = "/api/realtime/ws";

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Url,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    /// Upper bound on TCP connect plus websocket upgrade.
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    /// Default timings (25s heartbeat, 3s reconnect, 10s handshake) against
    /// `base_url`.
    pub fn from_base_url(base_url: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            endpoint: endpoint_for(base_url)?,
            heartbeat_interval: Duration::from_secs(25),
            reconnect_interval: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ChannelError> {
        let mut channel = Self::from_base_url(&config.base_url)?;
        if let Some(url) = &config.realtime_url {
            channel.endpoint = Url::parse(url)?;
        }
        channel.heartbeat_interval = config.heartbeat_interval();
        channel.reconnect_interval = config.reconnect_interval();
        channel.connect_timeout = config.connect_timeout();
        Ok(channel)
    }
}

/// Websocket endpoint for a backend origin; the scheme mirrors the origin's
/// (`https` -> `wss`, `http` -> `ws`).
pub fn endpoint_for(base_url: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChannelError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::InvalidEndpoint(base_url.to_string()))?;
    url.set_path(REALTIME_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

struct Connection {
    id: u64,
    close_tx: Option<oneshot::Sender<()>>,
    _task: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    connection: Option<Connection>,
    reconnect: Option<JoinHandle<()>>,
    next_id: u64,
}

struct ChannelInner {
    config: ChannelConfig,
    registry: SubscriberRegistry,
    state_tx: watch::Sender<ConnectionState>,
    slots: Mutex<Slots>,
}

/// Handle to the realtime channel. Clones share one connection and one
/// subscriber table; dropping the last clone tears both down.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                registry: SubscriberRegistry::new(),
                state_tx,
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.config.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Start connecting. No-op while connecting or connected.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn on(&self, event: &str, handler: Handler) -> Subscription {
        self.inner.registry.on(event, handler)
    }

    pub fn off(&self, event: &str, handler: &Handler) -> usize {
        self.inner.registry.off(event, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.registry.unsubscribe(subscription)
    }
}

impl ChannelInner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Realtime state {:?} -> {:?}", previous, state);
        }
    }

    fn connect(self: &Arc<Self>) {
        let mut slots = self.slots();
        let state = *self.state_tx.borrow();
        if state != ConnectionState::Disconnected {
            tracing::debug!("connect() ignored, already {:?}", state);
            return;
        }

        let id = slots.next_id;
        slots.next_id += 1;
        self.set_state(ConnectionState::Connecting);

        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_connection(
            Arc::downgrade(self),
            id,
            self.config.endpoint.clone(),
            self.config.heartbeat_interval,
            self.config.connect_timeout,
            close_rx,
        ));
        slots.connection = Some(Connection {
            id,
            close_tx: Some(close_tx),
            _task: task,
        });
    }

    fn disconnect(&self) {
        let mut slots = self.slots();
        if let Some(reconnect) = slots.reconnect.take() {
            reconnect.abort();
        }
        if let Some(mut connection) = slots.connection.take() {
            if let Some(close_tx) = connection.close_tx.take() {
                let _ = close_tx.send(());
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Realtime channel disconnected");
    }

    /// Returns false if `id` is no longer the current connection.
    fn on_open(&self, id: u64) -> bool {
        let mut slots = self.slots();
        if slots.connection.as_ref().map(|c| c.id) != Some(id) {
            return false;
        }
        self.set_state(ConnectionState::Connected);
        if let Some(reconnect) = slots.reconnect.take() {
            reconnect.abort();
            tracing::debug!("Reconnect loop cancelled");
        }
        tracing::info!("Realtime channel connected");
        true
    }

    fn on_closed(self: &Arc<Self>, id: u64) {
        let mut slots = self.slots();
        if slots.connection.as_ref().map(|c| c.id) != Some(id) {
            return;
        }
        slots.connection = None;
        self.set_state(ConnectionState::Disconnected);

        if slots.reconnect.is_none() {
            let every = self.config.reconnect_interval;
            tracing::info!("Realtime channel lost, reconnecting every {}ms", every.as_millis());
            slots.reconnect = Some(tokio::spawn(reconnect_loop(Arc::downgrade(self), every)));
        }
    }

    fn handle_text(&self, text: &str) {
        match envelope::classify(text) {
            Ok(Inbound::Heartbeat) => tracing::debug!("Realtime heartbeat"),
            Ok(Inbound::Event(envelope)) => {
                self.registry.dispatch(&envelope);
            }
            Err(e) => tracing::warn!("Dropping malformed realtime frame: {}", e),
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(reconnect) = slots.reconnect.take() {
            reconnect.abort();
        }
        // Dropping the close sender ends the connection task.
        slots.connection.take();
    }
}

async fn reconnect_loop(channel: Weak<ChannelInner>, every: Duration) {
    let mut ticker = time::interval(every);
    ticker.tick().await; // skip first immediate tick
    loop {
        ticker.tick().await;
        let Some(inner) = channel.upgrade() else {
            return;
        };
        tracing::debug!("Reconnect attempt");
        inner.connect();
    }
}

/// Drive one physical connection from open to close.
async fn run_connection(
    channel: Weak<ChannelInner>,
    id: u64,
    endpoint: Url,
    heartbeat_every: Duration,
    connect_timeout: Duration,
    mut close_rx: oneshot::Receiver<()>,
) {
    let opened = tokio::select! {
        result = time::timeout(connect_timeout, socket::open(&endpoint)) => {
            result.unwrap_or(Err(ChannelError::HandshakeTimeout(connect_timeout)))
        }
        _ = &mut close_rx => return,
    };

    let (mut writer, mut reader) = match opened {
        Ok(halves) => halves,
        Err(e) => {
            tracing::warn!("Realtime connection failed: {}", e);
            if let Some(inner) = channel.upgrade() {
                inner.on_closed(id);
            }
            return;
        }
    };

    let still_current = channel.upgrade().is_some_and(|inner| inner.on_open(id));
    if !still_current {
        writer.close().await;
        return;
    }

    let mut heartbeat = time::interval(heartbeat_every);
    heartbeat.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            frame = reader.recv_frame() => match frame {
                Ok(Some(Frame::Text(text))) => {
                    let Some(inner) = channel.upgrade() else { break };
                    inner.handle_text(&text);
                }
                Ok(Some(Frame::Ping(data))) => {
                    if let Err(e) = writer.pong(data).await {
                        tracing::warn!("Failed to answer ping: {}", e);
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!("Realtime connection closed by server");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Realtime connection error: {}", e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if let Err(e) = writer.send_text(PING_FRAME).await {
                    tracing::warn!("Heartbeat send failed: {}", e);
                    break;
                }
            }
            _ = &mut close_rx => {
                writer.close().await;
                return;
            }
        }
    }

    writer.close().await;
    if let Some(inner) = channel.upgrade() {
        inner.on_closed(id);
    }
}
