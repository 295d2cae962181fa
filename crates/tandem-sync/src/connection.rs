//! # Store Link
//!
//! Long-lived WebSocket to a hosted record store. A background worker owns
//! the socket, redials with exponential backoff and hands every decoded
//! frame to the owner as a [`ConnectionEvent`].
//!
//! ```text
//!          ┌──────────── stop ────────────┐
//!          ▼                              │
//!     Disconnected ◄── retries spent ── Backoff ◄── dial failed / socket closed
//!          │                              │                    ▲
//!        spawn                         timer                   │
//!          ▼                              ▼                    │
//!     Connecting ──── handshake ok ──► Connected ──────────────┘
//!                                         │
//!                                         └─► ConnectionEvent::Connected
//!                                             (owner re-subscribes its zones)
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::RemoteSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{JsonFrame, StoreMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOX_DEPTH: usize = 100;

// =============================================================================
// State and events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Sleeping before the next dial.
    Backoff,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Backoff => "backoff",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Message(StoreMessage),
    Disconnected,
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Dials allowed in a row without a successful session. 0 never gives up.
    pub max_retries: u32,
    pub ping_interval: Duration,
}

impl ConnectionConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        RemoteSettings::default().into()
    }
}

impl From<&RemoteSettings> for ConnectionConfig {
    fn from(remote: &RemoteSettings) -> Self {
        ConnectionConfig {
            url: remote.url.clone(),
            connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
            initial_backoff: Duration::from_millis(remote.initial_backoff_ms),
            max_backoff: Duration::from_secs(remote.max_backoff_secs),
            max_retries: remote.max_retries,
            ping_interval: Duration::from_secs(remote.ping_interval_secs),
        }
    }
}

impl From<RemoteSettings> for ConnectionConfig {
    fn from(remote: RemoteSettings) -> Self {
        ConnectionConfig::from(&remote)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable front of the link worker.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbox: mpsc::Sender<StoreMessage>,
    state: watch::Receiver<LinkState>,
    stop: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Queues a frame; it goes out once a socket is up.
    pub async fn send(&self, message: StoreMessage) -> SyncResult<()> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelError("store link worker has exited".into()))
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Asks the worker to close the socket and exit.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.stop
            .send(true)
            .map_err(|_| SyncError::ChannelError("store link worker has exited".into()))
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Owns the socket. Create it with [`StoreConnection::spawn`]:
///
/// ```rust,ignore
/// let (link, mut events) = StoreConnection::spawn(ConnectionConfig::from(&config.remote));
/// link.send(StoreMessage::CreateZone { request_id: 1, zone }).await?;
/// while let Some(ConnectionEvent::Message(frame)) = events.recv().await { /* ... */ }
/// ```
pub struct StoreConnection {
    config: ConnectionConfig,
    state: watch::Sender<LinkState>,
    outbox: mpsc::Receiver<StoreMessage>,
    events: mpsc::Sender<ConnectionEvent>,
    stop: watch::Receiver<bool>,
}

/// Why a socket session ended.
enum SessionEnd {
    Closed,
    Stopped,
}

impl StoreConnection {
    pub fn spawn(config: ConnectionConfig) -> (ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = StoreConnection {
            config,
            state: state_tx,
            outbox: outbox_rx,
            events: events_tx,
            stop: stop_rx,
        };
        tokio::spawn(worker.run());

        let handle = ConnectionHandle {
            outbox: outbox_tx,
            state: state_rx,
            stop: Arc::new(stop_tx),
        };
        (handle, events_rx)
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Store link starting");
        let mut backoff = self.config.backoff();
        let mut misses = 0u32;

        while !self.stop_requested() {
            self.state.send_replace(LinkState::Connecting);

            match self.dial().await {
                Ok(socket) => {
                    info!(url = %self.config.url, "Store link up");
                    self.state.send_replace(LinkState::Connected);
                    backoff.reset();
                    misses = 0;

                    if self.events.send(ConnectionEvent::Connected).await.is_err() {
                        break;
                    }
                    let ended = self.session(socket).await;
                    let _ = self.events.send(ConnectionEvent::Disconnected).await;
                    match ended {
                        Ok(SessionEnd::Stopped) => break,
                        Ok(SessionEnd::Closed) => debug!("Store closed the socket"),
                        Err(e) => warn!(error = %e, "Store link dropped"),
                    }
                }
                Err(e) => warn!(error = %e, url = %self.config.url, "Store unreachable"),
            }

            misses += 1;
            if self.config.max_retries > 0 && misses >= self.config.max_retries {
                warn!(misses, "Giving up on the store link");
                break;
            }

            let Some(wait) = backoff.next_backoff() else {
                break;
            };
            self.state.send_replace(LinkState::Backoff);
            debug!(?wait, misses, "Redialing after backoff");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.stop.changed() => break,
            }
        }

        self.state.send_replace(LinkState::Disconnected);
        info!("Store link stopped");
    }

    async fn dial(&self) -> SyncResult<Socket> {
        let limit = self.config.connect_timeout;
        let (socket, response) = tokio::time::timeout(limit, connect_async(&self.config.url))
            .await
            .map_err(|_| SyncError::Timeout(limit.as_secs()))??;
        debug!(status = ?response.status(), "Handshake done");
        Ok(socket)
    }

    /// Pumps frames both ways until the socket closes or a stop arrives.
    async fn session(&mut self, socket: Socket) -> SyncResult<SessionEnd> {
        let (mut sink, mut stream) = socket.split();
        let mut keepalive = tokio::time::interval(self.config.ping_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(outgoing) = self.outbox.recv() => {
                    debug!(kind = %outgoing.type_name(), "-> store");
                    sink.send(Frame::Text(outgoing.to_json()?.into())).await?;
                }

                incoming = stream.next() => {
                    let frame = match incoming {
                        None => return Ok(SessionEnd::Closed),
                        Some(frame) => frame?,
                    };
                    match frame {
                        Frame::Text(text) => {
                            let message = match StoreMessage::from_json(&text) {
                                Ok(message) => message,
                                Err(e) => {
                                    warn!(error = %e, "Dropping unreadable store frame");
                                    continue;
                                }
                            };
                            if let StoreMessage::Ping { timestamp } = &message {
                                let pong = StoreMessage::pong(timestamp).to_json()?;
                                sink.send(Frame::Text(pong.into())).await?;
                                continue;
                            }
                            debug!(kind = %message.type_name(), "<- store");
                            self.events
                                .send(ConnectionEvent::Message(message))
                                .await
                                .map_err(|_| {
                                    SyncError::ChannelError("link owner went away".into())
                                })?;
                        }
                        Frame::Ping(payload) => sink.send(Frame::Pong(payload)).await?,
                        Frame::Close(reason) => {
                            debug!(?reason, "Close frame");
                            return Ok(SessionEnd::Closed);
                        }
                        Frame::Binary(_) => warn!("Ignoring binary store frame"),
                        Frame::Pong(_) | Frame::Frame(_) => {}
                    }
                }

                _ = keepalive.tick() => {
                    sink.send(Frame::Ping(Vec::new().into())).await?;
                }

                _ = self.stop.changed() => {
                    let _ = sink.send(Frame::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
            }
        }
    }
}
