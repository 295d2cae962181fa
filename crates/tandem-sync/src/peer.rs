//! # Peer Link
//!
//! Direct device-to-device delivery of change batches over a LAN, a wired
//! bridge, or the VPN overlay. The cloud store stays the source of truth;
//! a peer push only gets changes onto nearby devices sooner.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  PeerClient (pushing device)          PeerServer (axum, port 18790)     │
//! │                                                                         │
//! │  connect ws://peer:18790/sync  ─────►                                  │
//! │  Hello {device, account, v1}   ─────►  account matches?                │
//! │                                ◄─────  Welcome  |  Error ACCOUNT_MISMATCH│
//! │  Changes {batch_id, ...}       ─────►  handler applies the batch       │
//! │                                ◄─────  Ack {batch_id}                  │
//! │  close                                                                  │
//! │                                                                         │
//! │  GET /health ──► "OK"                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

use crate::config::PeerSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{codes, ChangeBatch, JsonFrame, PeerHello, PeerMessage, PROTOCOL_VERSION};

/// Time a new connection gets to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Identity / Handler
// =============================================================================

/// This device as seen by its peers.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub device_id: String,
    pub device_name: String,
    pub account_id: String,
}

/// Receives batches pushed by peers.
#[async_trait]
pub trait PeerBatchHandler: Send + Sync {
    /// Applies a batch. The sender is acked only on `Ok`.
    async fn handle_batch(&self, from_device: &str, batch: ChangeBatch) -> SyncResult<()>;
}

// =============================================================================
// Server
// =============================================================================

struct PeerState {
    identity: PeerIdentity,
    handler: Arc<dyn PeerBatchHandler>,
    max_message_size: usize,
}

/// Handle for a running peer server.
pub struct PeerServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PeerServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for open ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            debug!(error = %e, "Peer server task ended abnormally");
        }
    }
}

pub struct PeerServer {
    bind_address: String,
    state: Arc<PeerState>,
}

impl PeerServer {
    pub fn new(
        settings: &PeerSettings,
        port: u16,
        identity: PeerIdentity,
        handler: Arc<dyn PeerBatchHandler>,
    ) -> Self {
        PeerServer {
            bind_address: format!("{}:{}", settings.bind_addr, port),
            state: Arc::new(PeerState {
                identity,
                handler,
                max_message_size: settings.max_message_size,
            }),
        }
    }

    /// Binds the listener and starts serving.
    pub async fn start(self) -> SyncResult<PeerServerHandle> {
        let app = Router::new()
            .route("/sync", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        let listener = TcpListener::bind(&self.bind_address).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Peer server started");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await;
                info!("Peer server shutting down");
            })
            .await;
            if let Err(e) = served {
                warn!(error = %e, "Peer server stopped with error");
            }
        });

        Ok(PeerServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<PeerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    debug!(addr = %addr, "Peer connection");
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<PeerState>, addr: SocketAddr) {
    let hello = match receive_hello(&mut socket).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(addr = %addr, ?e, "No valid Hello from peer, closing");
            return;
        }
    };

    if let Some(reject) = check_hello(&state.identity, &hello) {
        warn!(device_id = %hello.device_id, addr = %addr, reason = ?reject, "Rejecting peer");
        let _ = send_peer_message(&mut socket, &reject).await;
        return;
    }

    let welcome = PeerMessage::Welcome {
        device_id: state.identity.device_id.clone(),
    };
    if let Err(e) = send_peer_message(&mut socket, &welcome).await {
        warn!(device_id = %hello.device_id, ?e, "Failed to send Welcome");
        return;
    }
    debug!(device_id = %hello.device_id, name = %hello.device_name, "Peer connected");

    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.as_str().to_string(),
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).to_string(),
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(device_id = %hello.device_id, ?e, "Peer socket error");
                break;
            }
        };

        let reply = match PeerMessage::from_json(&text) {
            Ok(PeerMessage::Changes(batch)) => {
                let batch_id = batch.batch_id;
                let size = batch.len();
                match state.handler.handle_batch(&hello.device_id, batch).await {
                    Ok(()) => {
                        info!(device_id = %hello.device_id, %batch_id, size, "Applied peer batch");
                        PeerMessage::Ack { batch_id }
                    }
                    Err(e) => {
                        warn!(
                            device_id = %hello.device_id,
                            %batch_id,
                            error = %e,
                            "Peer batch failed"
                        );
                        PeerMessage::error(codes::INTERNAL, e.to_string())
                    }
                }
            }
            Ok(PeerMessage::Ping { timestamp }) => PeerMessage::pong(&timestamp),
            Ok(other) => PeerMessage::error(
                codes::INVALID_MESSAGE,
                format!("unexpected {}", other.type_name()),
            ),
            Err(e) => PeerMessage::error(codes::INVALID_MESSAGE, e.to_string()),
        };

        if send_peer_message(&mut socket, &reply).await.is_err() {
            break;
        }
    }

    debug!(device_id = %hello.device_id, "Peer disconnected");
}

/// Returns the rejection for a Hello this device will not accept.
fn check_hello(identity: &PeerIdentity, hello: &PeerHello) -> Option<PeerMessage> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Some(PeerMessage::error(
            codes::UNSUPPORTED_VERSION,
            format!("protocol {} not supported", hello.protocol_version),
        ));
    }
    if hello.account_id != identity.account_id {
        return Some(PeerMessage::error(
            codes::ACCOUNT_MISMATCH,
            "Account does not match",
        ));
    }
    None
}

async fn receive_hello(socket: &mut WebSocket) -> SyncResult<PeerHello> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, socket.recv())
        .await
        .map_err(|_| SyncError::Timeout(HELLO_TIMEOUT.as_secs()))?;

    let text = match frame {
        Some(Ok(Message::Text(text))) => text.as_str().to_string(),
        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).to_string(),
        Some(Ok(_)) => return Err(SyncError::InvalidMessage("Expected text message".into())),
        Some(Err(e)) => return Err(SyncError::WebSocketError(e.to_string())),
        None => return Err(SyncError::Disconnected),
    };

    match PeerMessage::from_json(&text)? {
        PeerMessage::Hello(hello) => Ok(hello),
        other => Err(SyncError::UnexpectedMessageType {
            expected: "Hello".into(),
            actual: other.type_name().into(),
        }),
    }
}

async fn send_peer_message(socket: &mut WebSocket, message: &PeerMessage) -> SyncResult<()> {
    let json = message.to_json()?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::WebSocketError(e.to_string()))
}

// =============================================================================
// Client
// =============================================================================

/// Pushes batches to peers, one short-lived connection per push.
#[derive(Debug, Clone)]
pub struct PeerClient {
    identity: PeerIdentity,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(identity: PeerIdentity, settings: &PeerSettings) -> Self {
        PeerClient {
            identity,
            timeout: Duration::from_secs(settings.push_timeout_secs),
        }
    }

    /// Delivers a batch and waits for the peer's ack.
    pub async fn push(&self, url: &str, batch: &ChangeBatch) -> SyncResult<()> {
        tokio::time::timeout(self.timeout, self.push_inner(url, batch))
            .await
            .map_err(|_| SyncError::Timeout(self.timeout.as_secs()))?
    }

    async fn push_inner(&self, url: &str, batch: &ChangeBatch) -> SyncResult<()> {
        let (mut ws, _) = connect_async(url).await?;

        let hello = PeerMessage::hello(
            &self.identity.device_id,
            &self.identity.device_name,
            &self.identity.account_id,
        );
        ws.send(WsMessage::Text(hello.to_json()?.into())).await?;

        match next_peer_message(&mut ws).await? {
            PeerMessage::Welcome { device_id } => debug!(peer = %device_id, "Peer accepted push"),
            PeerMessage::Error { code, message } => {
                return Err(SyncError::Rejected { code, message });
            }
            other => {
                return Err(SyncError::UnexpectedMessageType {
                    expected: "Welcome".into(),
                    actual: other.type_name().into(),
                })
            }
        }

        let changes = PeerMessage::Changes(batch.clone());
        ws.send(WsMessage::Text(changes.to_json()?.into())).await?;

        let result = match next_peer_message(&mut ws).await? {
            PeerMessage::Ack { batch_id } if batch_id == batch.batch_id => Ok(()),
            PeerMessage::Error { code, message } => Err(SyncError::Rejected { code, message }),
            other => Err(SyncError::UnexpectedMessageType {
                expected: "Ack".into(),
                actual: other.type_name().into(),
            }),
        };

        let _ = ws.close(None).await;
        result
    }
}

async fn next_peer_message<S>(ws: &mut S) -> SyncResult<PeerMessage>
where
    S: futures_util::Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) => return Ok(PeerMessage::from_json(text.as_str())?),
            WsMessage::Close(_) => break,
            _ => continue,
        }
    }
    Err(SyncError::Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use tandem_core::{Project, ZoneId};

    #[derive(Default)]
    struct Collector {
        batches: Mutex<Vec<(String, ChangeBatch)>>,
    }

    #[async_trait]
    impl PeerBatchHandler for Collector {
        async fn handle_batch(&self, from_device: &str, batch: ChangeBatch) -> SyncResult<()> {
            self.batches.lock().push((from_device.to_string(), batch));
            Ok(())
        }
    }

    fn identity(device_id: &str, account_id: &str) -> PeerIdentity {
        PeerIdentity {
            device_id: device_id.into(),
            device_name: device_id.into(),
            account_id: account_id.into(),
        }
    }

    fn settings() -> PeerSettings {
        PeerSettings {
            bind_addr: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    async fn server(collector: Arc<Collector>) -> PeerServerHandle {
        PeerServer::new(&settings(), 0, identity("dev-studio", "acct-1"), collector)
            .start()
            .await
            .unwrap()
    }

    fn batch() -> ChangeBatch {
        let project = Project::new(ZoneId::default(), "Garden", Utc::now());
        ChangeBatch::new("dev-laptop", vec![project.into()], Vec::new())
    }

    #[tokio::test]
    async fn test_push_is_applied_and_acked() {
        let collector = Arc::new(Collector::default());
        let handle = server(collector.clone()).await;
        let url = format!("ws://{}/sync", handle.local_addr());

        let client = PeerClient::new(identity("dev-laptop", "acct-1"), &settings());
        let batch = batch();
        client.push(&url, &batch).await.unwrap();

        let received = collector.batches.lock().clone();
        assert_eq!(received, vec![("dev-laptop".to_string(), batch)]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_other_account_is_rejected() {
        let collector = Arc::new(Collector::default());
        let handle = server(collector.clone()).await;
        let url = format!("ws://{}/sync", handle.local_addr());

        let client = PeerClient::new(identity("dev-intruder", "acct-2"), &settings());
        match client.push(&url, &batch()).await {
            Err(SyncError::Rejected { code, .. }) => assert_eq!(code, codes::ACCOUNT_MISMATCH),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(collector.batches.lock().is_empty());

        handle.shutdown().await;
    }

    #[test]
    fn test_version_check() {
        let me = identity("dev-studio", "acct-1");
        let mut hello = match PeerMessage::hello("dev-laptop", "Laptop", "acct-1") {
            PeerMessage::Hello(hello) => hello,
            _ => unreachable!(),
        };
        assert_eq!(check_hello(&me, &hello), None);

        hello.protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            check_hello(&me, &hello),
            Some(PeerMessage::Error { ref code, .. }) if code == codes::UNSUPPORTED_VERSION
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PeerClient::new(identity("dev-laptop", "acct-1"), &settings());
        let result = client.push(&format!("ws://{}/sync", addr), &batch()).await;
        assert!(result.unwrap_err().is_retryable());
    }
}
