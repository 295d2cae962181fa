//! # Cloud Record Store
//!
//! [`RecordStore`] over a hosted store speaking [`StoreMessage`] JSON on a
//! WebSocket.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  caller ── request(id=7) ──► pending{7: oneshot} ──► StoreConnection   │
//! │                                                           │             │
//! │  caller ◄── oneshot ◄── dispatcher ◄── response(id=7) ◄───┘             │
//! │                              │                                          │
//! │                              ├── ZoneChanged ──► broadcast wakeup       │
//! │                              ├── Connected ──► re-issue subscriptions   │
//! │                              └── Disconnected ──► fail pending requests │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests that get no answer within the request timeout fail with
//! [`SyncError::Timeout`]. Nothing is retried here; the orchestrator retries
//! on its next cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    RecordStore, SaveRecordResult, SubscriptionStatus, ZoneCreation, ZoneFetch, ZoneNotification,
};
use crate::config::RemoteSettings;
use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionHandle, StoreConnection};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{codes, JsonFrame, StoreMessage};
use tandem_core::{ChangeToken, Record, RecordKey, ZoneId};

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<StoreMessage>>>>;
type Subscriptions = Arc<Mutex<HashMap<ZoneId, Vec<String>>>>;

/// Hosted record store client.
pub struct CloudRecordStore {
    connection: ConnectionHandle,
    pending: PendingRequests,
    subscriptions: Subscriptions,
    next_request_id: Arc<AtomicU64>,
    request_timeout: Duration,
    notify_tx: broadcast::Sender<ZoneNotification>,
    dispatcher: JoinHandle<()>,
}

impl CloudRecordStore {
    /// Starts the connection worker and the response dispatcher.
    pub fn connect(settings: &RemoteSettings) -> SyncResult<Self> {
        let url = url::Url::parse(&settings.url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(SyncError::InvalidUrl(format!(
                "cloud store needs ws:// or wss://, got {}",
                settings.url
            )));
        }

        let (connection, events) = StoreConnection::spawn(ConnectionConfig::from(settings));
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let next_request_id = Arc::new(AtomicU64::new(1));
        let (notify_tx, _) = broadcast::channel(64);

        let dispatcher = tokio::spawn(dispatch(
            events,
            connection.clone(),
            pending.clone(),
            subscriptions.clone(),
            next_request_id.clone(),
            notify_tx.clone(),
        ));

        info!(url = %settings.url, "Cloud record store configured");

        Ok(CloudRecordStore {
            connection,
            pending,
            subscriptions,
            next_request_id,
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            notify_tx,
            dispatcher,
        })
    }

    /// Closes the connection.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.connection.shutdown().await
    }

    async fn request<F>(&self, build: F) -> SyncResult<StoreMessage>
    where
        F: FnOnce(u64) -> StoreMessage,
    {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let message = build(id);
        let expected = message.type_name();
        if let Err(e) = self.connection.send(message).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(StoreMessage::Error { code, message, .. })) => Err(store_error(code, message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(request = expected, id, "Store request timed out");
                Err(SyncError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }
}

impl Drop for CloudRecordStore {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn store_error(code: String, message: String) -> SyncError {
    if code == codes::ZONE_NOT_FOUND {
        SyncError::ZoneNotFound(message)
    } else {
        SyncError::RemoteStore(format!("{}: {}", code, message))
    }
}

fn unexpected(expected: &str, actual: &StoreMessage) -> SyncError {
    SyncError::UnexpectedMessageType {
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}

async fn dispatch(
    mut events: mpsc::Receiver<ConnectionEvent>,
    connection: ConnectionHandle,
    pending: PendingRequests,
    subscriptions: Subscriptions,
    next_request_id: Arc<AtomicU64>,
    notify_tx: broadcast::Sender<ZoneNotification>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected => {
                let zones: Vec<(ZoneId, Vec<String>)> = subscriptions
                    .lock()
                    .iter()
                    .map(|(zone, types)| (zone.clone(), types.clone()))
                    .collect();

                for (zone, record_types) in zones {
                    debug!(zone = %zone, "Re-issuing zone subscription");
                    let request_id = next_request_id.fetch_add(1, Ordering::Relaxed);
                    let message = StoreMessage::Subscribe {
                        request_id,
                        zone,
                        record_types,
                    };
                    if connection.send(message).await.is_err() {
                        return;
                    }
                }
            }
            ConnectionEvent::Message(StoreMessage::ZoneChanged { zone }) => {
                let _ = notify_tx.send(ZoneNotification { zone });
            }
            ConnectionEvent::Message(message) => {
                let waiter = message.request_id().and_then(|id| pending.lock().remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => {
                        debug!(msg_type = %message.type_name(), "Dropping unmatched store message")
                    }
                }
            }
            ConnectionEvent::Disconnected => {
                let dropped = std::mem::take(&mut *pending.lock());
                if !dropped.is_empty() {
                    warn!(count = dropped.len(), "Connection lost with requests in flight");
                }
            }
        }
    }
}

#[async_trait]
impl RecordStore for CloudRecordStore {
    async fn create_zone(&self, zone: &ZoneId) -> SyncResult<ZoneCreation> {
        let zone = zone.clone();
        match self.request(|request_id| StoreMessage::CreateZone { request_id, zone }).await? {
            StoreMessage::ZoneCreated { already_existed: false, .. } => Ok(ZoneCreation::Created),
            StoreMessage::ZoneCreated { already_existed: true, .. } => {
                Ok(ZoneCreation::AlreadyExists)
            }
            other => Err(unexpected("ZoneCreated", &other)),
        }
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: u32,
    ) -> SyncResult<ZoneFetch> {
        let zone = zone.clone();
        let token = token.cloned();
        let response = self
            .request(|request_id| StoreMessage::FetchChanges {
                request_id,
                zone,
                token,
                limit,
            })
            .await?;

        match response {
            StoreMessage::ChangesPage { page, .. } => Ok(ZoneFetch::Page(page)),
            StoreMessage::TokenExpired { .. } => Ok(ZoneFetch::TokenExpired),
            other => Err(unexpected("ChangesPage", &other)),
        }
    }

    async fn save_record(&self, record: Record) -> SyncResult<SaveRecordResult> {
        match self.request(|request_id| StoreMessage::SaveRecord { request_id, record }).await? {
            StoreMessage::RecordSaved { record, .. } => Ok(SaveRecordResult::Saved(record)),
            StoreMessage::SaveConflict { server, .. } => Ok(SaveRecordResult::Conflict { server }),
            other => Err(unexpected("RecordSaved", &other)),
        }
    }

    async fn delete_record(&self, key: &RecordKey) -> SyncResult<()> {
        let key = key.clone();
        match self.request(|request_id| StoreMessage::DeleteRecord { request_id, key }).await? {
            StoreMessage::RecordDeleted { .. } => Ok(()),
            other => Err(unexpected("RecordDeleted", &other)),
        }
    }

    async fn subscribe(
        &self,
        zone: &ZoneId,
        record_types: &[String],
    ) -> SyncResult<SubscriptionStatus> {
        self.subscriptions
            .lock()
            .insert(zone.clone(), record_types.to_vec());

        let zone = zone.clone();
        let record_types = record_types.to_vec();
        let response = self
            .request(|request_id| StoreMessage::Subscribe {
                request_id,
                zone,
                record_types,
            })
            .await?;

        match response {
            StoreMessage::Subscribed { already_existed: false, .. } => {
                Ok(SubscriptionStatus::Created)
            }
            StoreMessage::Subscribed { already_existed: true, .. } => {
                Ok(SubscriptionStatus::AlreadyExists)
            }
            other => Err(unexpected("Subscribed", &other)),
        }
    }

    fn notifications(&self) -> broadcast::Receiver<ZoneNotification> {
        self.notify_tx.subscribe()
    }
}
