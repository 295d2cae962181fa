//! # Sync Orchestrator
//!
//! Owns the change token and the pending queue, and runs every delta sync.
//!
//! ## Delta Sync
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. create zone if absent           (already exists = fine)             │
//! │  2. token = stored token            (unreadable = none = full fetch)    │
//! │  3. fetch changes since token                                           │
//! │        │                                                                │
//! │        ├── Changes ──► merge each entity with the local copy            │
//! │        │               apply if the local copy changed                  │
//! │        │               requeue if the store copy is stale               │
//! │        │               delete locally + EntityDeletedRemotely           │
//! │        │               advance settings mark (this class only)          │
//! │        │               persist new token                                │
//! │        │                                                                │
//! │        └── TokenExpired ──► clear token (next sync fetches everything)  │
//! │                                                                         │
//! │  4. flush pending changes           (and hand them to LAN/VPN peers)   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Worker
//! One task processes one command at a time, so syncs of the zone never
//! overlap and the token only moves forward in order. Every trigger (a
//! push notification, the poll timer, `sync_now`) becomes exactly one
//! delta sync.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::discovery::PeerDirectory;
use crate::error::{SyncError, SyncResult};
use crate::events::{FlushReport, SyncEvent, SyncReport, SyncState, SyncStatus};
use crate::local::{LocalStore, SyncStateStore};
use crate::outbox::{FlushOutcome, Outbox};
use crate::peer::{PeerBatchHandler, PeerClient};
use crate::protocol::ChangeBatch;
use crate::remote::{FetchOutcome, RemoteStoreClient};
use crate::resolver::ConflictResolver;
use crate::transport::{TransportChange, TransportSelectorHandle};
use tandem_core::merge::{merge_entities, settings_in_scope};
use tandem_core::{
    DeviceClass, EntityKind, EntityRef, MergeContext, PendingChange, SyncEntity, TransportKind,
    ZoneId,
};

// =============================================================================
// Orchestrator
// =============================================================================

/// Who this orchestrator syncs for.
#[derive(Debug, Clone)]
pub struct OrchestratorIdentity {
    pub zone: ZoneId,
    pub device_id: String,
    pub device_class: DeviceClass,
}

/// Direct delivery of pushed changes to peers on a fast path.
pub struct PeerFanout {
    client: PeerClient,
    directory: Arc<dyn PeerDirectory>,
}

impl PeerFanout {
    pub fn new(client: PeerClient, directory: Arc<dyn PeerDirectory>) -> Self {
        PeerFanout { client, directory }
    }

    /// Pushes the batch to every known peer. Returns how many acked.
    async fn deliver(&self, batch: &ChangeBatch) -> usize {
        let urls: Vec<String> = self
            .directory
            .peers()
            .iter()
            .filter_map(|peer| peer.sync_url())
            .collect();
        if urls.is_empty() {
            return 0;
        }

        let results = join_all(urls.iter().map(|url| self.client.push(url, batch))).await;
        results
            .iter()
            .zip(&urls)
            .filter(|(result, url)| match result {
                Ok(()) => true,
                Err(e) => {
                    debug!(peer = %url, error = %e, "Peer push failed");
                    false
                }
            })
            .count()
    }
}

/// Where a remote entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Store,
    Peer,
}

/// Delta sync, queueing and flushing. Wrapped by [`SyncOrchestratorHandle`]
/// once spawned.
pub struct SyncOrchestrator {
    identity: OrchestratorIdentity,
    settings: SyncSettings,
    client: Arc<RemoteStoreClient>,
    local: Arc<dyn LocalStore>,
    state: Arc<dyn SyncStateStore>,
    outbox: Outbox,
    transport: Option<TransportSelectorHandle>,
    peers: Option<PeerFanout>,
    events: broadcast::Sender<SyncEvent>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncOrchestrator {
    pub fn new(
        identity: OrchestratorIdentity,
        settings: SyncSettings,
        client: Arc<RemoteStoreClient>,
        local: Arc<dyn LocalStore>,
        state: Arc<dyn SyncStateStore>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let resolver =
            Arc::new(ConflictResolver::new(client.clone(), settings.max_conflict_retries));
        let outbox = Outbox::new(state.clone(), resolver, settings.max_push_attempts);

        SyncOrchestrator {
            identity,
            settings,
            client,
            local,
            state,
            outbox,
            transport: None,
            peers: None,
            events,
            status: Arc::new(RwLock::new(SyncStatus::default())),
        }
    }

    /// Follows the transport selector; peers are only pushed to directly
    /// while a non-cloud transport is active.
    pub fn with_transport(mut self, transport: TransportSelectorHandle) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_peers(mut self, peers: PeerFanout) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Delta Sync
    // =========================================================================

    /// Runs one delta sync and updates status and events with the result.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        self.status.write().state = SyncState::Syncing;

        let result = self.perform_delta_sync().await;
        match &result {
            Ok(report) => {
                {
                    let mut status = self.status.write();
                    status.state = SyncState::Idle;
                    status.last_sync = Some(Utc::now());
                    status.last_error = None;
                }
                info!(
                    zone = %report.zone,
                    applied = report.applied,
                    deleted = report.deleted,
                    pushed = report.flush.pushed,
                    token_expired = report.token_expired,
                    "Delta sync complete"
                );
                self.emit(SyncEvent::SyncCompleted { report: report.clone() });
            }
            Err(e) => {
                {
                    let mut status = self.status.write();
                    status.state = SyncState::Paused;
                    status.last_error = Some(e.to_string());
                }
                warn!(error = %e, retryable = e.is_retryable(), "Delta sync failed");
                self.emit(SyncEvent::SyncFailed {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
        self.refresh_pending_count().await;
        result
    }

    /// Fetch, merge, apply, persist the token, then flush.
    pub async fn perform_delta_sync(&self) -> SyncResult<SyncReport> {
        let zone = self.identity.zone.clone();
        self.client.create_zone_if_absent(&zone).await?;

        let token = match self.state.token(&zone).await {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    zone = %zone,
                    error = %e,
                    "Stored change token unreadable, fetching everything"
                );
                None
            }
        };
        debug!(zone = %zone, has_token = token.is_some(), "Fetching zone changes");

        let ctx = self.merge_context().await;
        let mut report = SyncReport {
            zone: zone.clone(),
            ..Default::default()
        };

        match self.client.fetch_changes(&zone, token.as_ref()).await? {
            FetchOutcome::Changes {
                changed,
                deleted,
                new_token,
            } => {
                let mut settings_seen: Option<DateTime<Utc>> = None;
                for entity in changed {
                    if let SyncEntity::Settings(settings) = &entity {
                        if settings_in_scope(settings, ctx.local_device_class) {
                            settings_seen = settings_seen.max(Some(settings.modified_at));
                        }
                    }
                    self.apply_remote(entity, &ctx, Source::Store, &mut report).await?;
                }
                for entity_ref in deleted {
                    self.apply_remote_deletion(entity_ref, &mut report).await?;
                }
                if let Some(at) = settings_seen {
                    self.state.advance_settings_mark(&zone, at).await?;
                }
                self.state.put_token(&zone, &new_token).await?;
            }
            FetchOutcome::TokenExpired => {
                info!(zone = %zone, "Change token expired, next sync fetches the whole zone");
                self.state.clear_token(&zone).await?;
                report.token_expired = true;
            }
        }

        report.flush = self.flush_pending().await?;
        Ok(report)
    }

    /// Merges one remote entity into the local store.
    async fn apply_remote(
        &self,
        remote: SyncEntity,
        ctx: &MergeContext,
        source: Source,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let entity_ref = remote.entity_ref();

        if let SyncEntity::Settings(settings) = &remote {
            if !settings_in_scope(settings, ctx.local_device_class) {
                debug!(entity = %entity_ref, "Settings scoped to another device class");
                report.unchanged += 1;
                return Ok(());
            }
        }

        let Some(local) = self.local.load(&entity_ref).await? else {
            if let SyncEntity::Settings(settings) = &remote {
                self.emit(SyncEvent::SettingsChangedRemotely {
                    settings_id: settings.id,
                    device_class: settings.device_class,
                    changed_fields: settings.values.keys().cloned().collect(),
                });
            }
            self.local.apply(remote).await?;
            report.applied += 1;
            return Ok(());
        };

        let outcome = merge_entities(&local, &remote, ctx)?;

        if outcome.local_changed {
            self.local.apply(outcome.merged.clone()).await?;
            report.applied += 1;
        } else {
            report.unchanged += 1;
        }

        if let SyncEntity::Settings(settings) = &outcome.merged {
            if !outcome.changed_fields.is_empty() {
                self.emit(SyncEvent::SettingsChangedRemotely {
                    settings_id: settings.id,
                    device_class: settings.device_class,
                    changed_fields: outcome.changed_fields.clone(),
                });
            }
        }

        let requeue = outcome.remote_stale
            && source == Source::Store
            && outcome.merged.kind() != EntityKind::Settings;
        if requeue {
            debug!(entity = %entity_ref, "Store copy is behind the merge, requeueing");
            self.state.enqueue(&PendingChange::update(outcome.merged)).await?;
            report.requeued += 1;
        }
        Ok(())
    }

    async fn apply_remote_deletion(
        &self,
        entity_ref: EntityRef,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let removed = self.local.remove(&entity_ref).await?;
        debug!(entity = %entity_ref, removed, "Applying remote deletion");
        report.deleted += 1;
        self.emit(SyncEvent::EntityDeletedRemotely { entity: entity_ref });
        Ok(())
    }

    /// Applies a batch pushed by a peer. The change token does not move.
    pub async fn apply_peer_batch(
        &self,
        from_device: &str,
        batch: ChangeBatch,
    ) -> SyncResult<SyncReport> {
        info!(
            from = %from_device,
            batch = %batch.batch_id,
            changes = batch.len(),
            "Applying peer batch"
        );

        let ctx = self.merge_context().await;
        let mut report = SyncReport {
            zone: self.identity.zone.clone(),
            ..Default::default()
        };
        for entity in batch.entities {
            if entity.zone() != &self.identity.zone {
                debug!(entity = %entity.entity_ref(), "Ignoring peer entity from another zone");
                continue;
            }
            self.apply_remote(entity, &ctx, Source::Peer, &mut report).await?;
        }
        for entity_ref in batch.deleted {
            self.apply_remote_deletion(entity_ref, &mut report).await?;
        }
        Ok(report)
    }

    // =========================================================================
    // Pending Changes
    // =========================================================================

    /// Queues a local change. Reaching the batch threshold flushes at once.
    pub async fn queue_change(&self, change: PendingChange) -> SyncResult<Option<FlushReport>> {
        debug!(
            entity = %change.entity_ref,
            operation = change.operation.as_str(),
            "Queueing change"
        );
        self.state.enqueue(&change).await?;

        let pending = self.state.pending_count().await?;
        self.status.write().pending_count = pending;

        if pending >= self.settings.batch_threshold as u64 {
            debug!(pending, threshold = self.settings.batch_threshold, "Batch threshold reached");
            return self.flush_pending().await.map(Some);
        }
        Ok(None)
    }

    /// Pushes the queue, reconciles what the store kept, and hands the
    /// batch to peers when a fast transport is up.
    pub async fn flush_pending(&self) -> SyncResult<FlushReport> {
        let ctx = self.merge_context().await;
        let FlushOutcome {
            mut report,
            saved,
            deleted,
            conflicts,
        } = self.outbox.flush(&ctx).await?;

        for entity in &saved {
            if let Err(e) = self.reconcile_saved(entity, &ctx).await {
                warn!(
                    entity = %entity.entity_ref(),
                    error = %e,
                    "Failed to apply saved version locally"
                );
            }
        }

        for (entity, attempts) in conflicts {
            warn!(entity = %entity, attempts, "Conflict needs manual resolution");
            self.emit(SyncEvent::ConflictUnresolved { entity, attempts });
        }

        if !saved.is_empty() || !deleted.is_empty() {
            report.peers_reached = self.fan_out(saved, deleted).await;
        }

        self.refresh_pending_count().await;
        Ok(report)
    }

    /// Brings the local copy up to the version the store accepted, which
    /// can carry the other side's edits after a conflict merge.
    async fn reconcile_saved(&self, saved: &SyncEntity, ctx: &MergeContext) -> SyncResult<()> {
        if saved.kind() == EntityKind::Settings {
            return Ok(());
        }
        if let Some(local) = self.local.load(&saved.entity_ref()).await? {
            let outcome = merge_entities(&local, saved, ctx)?;
            if outcome.local_changed {
                self.local.apply(outcome.merged).await?;
            }
        }
        Ok(())
    }

    async fn fan_out(&self, saved: Vec<SyncEntity>, deleted: Vec<EntityRef>) -> usize {
        let (Some(peers), Some(transport)) = (&self.peers, &self.transport) else {
            return 0;
        };
        let active = transport.active();
        if active == TransportKind::CloudRelay {
            return 0;
        }

        let batch = ChangeBatch::new(self.identity.device_id.clone(), saved, deleted);
        let reached = peers.deliver(&batch).await;
        debug!(transport = %active, batch = %batch.batch_id, reached, "Delivered batch to peers");
        reached
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn merge_context(&self) -> MergeContext {
        let last_settings_sync = match self.state.settings_mark(&self.identity.zone).await {
            Ok(mark) => mark,
            Err(e) => {
                warn!(error = %e, "Settings mark unreadable, treating as never synced");
                None
            }
        };
        MergeContext {
            last_settings_sync,
            local_device_class: Some(self.identity.device_class),
        }
    }

    async fn refresh_pending_count(&self) {
        match self.state.pending_count().await {
            Ok(count) => self.status.write().pending_count = count,
            Err(e) => debug!(error = %e, "Could not count pending changes"),
        }
    }

    fn on_transport_change(&self, change: TransportChange) {
        info!(from = %change.from, to = %change.to, reason = ?change.reason, "Transport changed");
        self.status.write().active_transport = change.to;
        self.emit(SyncEvent::TransportChanged { change });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Worker
    // =========================================================================

    /// Moves the orchestrator onto its own task.
    pub fn spawn(self) -> SyncOrchestratorHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let handle = SyncOrchestratorHandle {
            command_tx,
            status: self.status.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(self.run(command_rx));
        handle
    }

    async fn run(self, mut command_rx: mpsc::Receiver<Command>) {
        let poll_every = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let flush_every = Duration::from_secs(self.settings.flush_interval_secs.max(1));
        info!(zone = %self.identity.zone, ?poll_every, ?flush_every, "Sync orchestrator starting");

        if let Some(transport) = &self.transport {
            self.status.write().active_transport = transport.active();
        }
        let mut transport_changes = self.transport.as_ref().map(|t| t.changes());

        let mut poll_tick = interval_at(Instant::now() + poll_every, poll_every);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush_tick = interval_at(Instant::now() + flush_every, flush_every);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(Command::Sync { trigger, reply }) => {
                        debug!(?trigger, "Sync requested");
                        let result = self.sync().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(Command::QueueChange { change, reply }) => {
                        let _ = reply.send(self.queue_change(change).await.map(|_| ()));
                    }
                    Some(Command::Flush { reply }) => {
                        let _ = reply.send(self.flush_pending().await);
                    }
                    Some(Command::PeerBatch { from_device, batch, reply }) => {
                        let applied = self.apply_peer_batch(&from_device, batch).await;
                        let _ = reply.send(applied.map(|_| ()));
                    }
                    Some(Command::Shutdown { done }) => {
                        self.status.write().state = SyncState::Stopped;
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },

                _ = poll_tick.tick() => {
                    debug!(trigger = ?SyncTrigger::Poll, "Sync requested");
                    let _ = self.sync().await;
                }

                _ = flush_tick.tick() => {
                    if let Err(e) = self.flush_pending().await {
                        warn!(error = %e, "Timed flush failed");
                    }
                }

                change = next_transport_change(&mut transport_changes) => {
                    self.on_transport_change(change);
                }
            }
        }

        self.status.write().state = SyncState::Stopped;
        info!("Sync orchestrator stopped");
    }
}

/// Next selector change. Never resolves without a selector or once the
/// selector has stopped.
async fn next_transport_change(
    changes: &mut Option<broadcast::Receiver<TransportChange>>,
) -> TransportChange {
    if let Some(rx) = changes {
        loop {
            match rx.recv().await {
                Ok(change) => return change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Missed transport changes");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        *changes = None;
    }
    std::future::pending().await
}

// =============================================================================
// Handle
// =============================================================================

/// Why a sync was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Manual,
    RemoteNotification,
    Poll,
}

enum Command {
    Sync {
        trigger: SyncTrigger,
        reply: Option<oneshot::Sender<SyncResult<SyncReport>>>,
    },
    QueueChange {
        change: PendingChange,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Flush {
        reply: oneshot::Sender<SyncResult<FlushReport>>,
    },
    PeerBatch {
        from_device: String,
        batch: ChangeBatch,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle for controlling a running orchestrator.
#[derive(Clone)]
pub struct SyncOrchestratorHandle {
    command_tx: mpsc::Sender<Command>,
    status: Arc<RwLock<SyncStatus>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestratorHandle {
    async fn send(&self, command: Command) -> SyncResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelError("Sync orchestrator stopped".into()))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command,
    ) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await
            .map_err(|_| SyncError::ChannelError("Sync orchestrator dropped reply".into()))?
    }

    /// Runs a delta sync now and waits for its report.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        self.request(|reply| Command::Sync {
            trigger: SyncTrigger::Manual,
            reply: Some(reply),
        })
        .await
    }

    /// Starts a delta sync without waiting for it.
    pub async fn request_sync(&self, trigger: SyncTrigger) -> SyncResult<()> {
        self.send(Command::Sync { trigger, reply: None }).await
    }

    /// A push notification from the store. Always one delta sync.
    pub async fn notify_remote_change(&self) -> SyncResult<()> {
        self.request_sync(SyncTrigger::RemoteNotification).await
    }

    pub async fn queue_change(&self, change: PendingChange) -> SyncResult<()> {
        self.request(|reply| Command::QueueChange { change, reply }).await
    }

    pub async fn flush(&self) -> SyncResult<FlushReport> {
        self.request(|reply| Command::Flush { reply }).await
    }

    pub async fn deliver_peer_batch(
        &self,
        from_device: &str,
        batch: ChangeBatch,
    ) -> SyncResult<()> {
        let from_device = from_device.to_string();
        self.request(|reply| Command::PeerBatch {
            from_device,
            batch,
            reply,
        })
        .await
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stops the worker after the command it is running.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (done, finished) = oneshot::channel();
        self.send(Command::Shutdown { done }).await?;
        finished
            .await
            .map_err(|_| SyncError::ChannelError("Sync orchestrator dropped reply".into()))
    }
}

#[async_trait]
impl PeerBatchHandler for SyncOrchestratorHandle {
    async fn handle_batch(&self, from_device: &str, batch: ChangeBatch) -> SyncResult<()> {
        self.deliver_peer_batch(from_device, batch).await.map_err(|e| {
            error!(from = %from_device, error = %e, "Peer batch not applied");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughCipher;
    use crate::local::{MemoryLocalStore, MemoryStateStore};
    use crate::remote::MemoryRecordStore;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use tandem_core::{ChangeToken, Conversation, Message, MessageRole, Project, Settings};

    struct Device {
        store: Arc<MemoryRecordStore>,
        local: Arc<MemoryLocalStore>,
        state: Arc<MemoryStateStore>,
        orchestrator: SyncOrchestrator,
    }

    fn device_on(
        store: Arc<MemoryRecordStore>,
        settings: SyncSettings,
        class: DeviceClass,
    ) -> Device {
        let client =
            Arc::new(RemoteStoreClient::new(store.clone(), Arc::new(PassthroughCipher), 50));
        let local = Arc::new(MemoryLocalStore::new());
        let state = Arc::new(MemoryStateStore::new());
        let identity = OrchestratorIdentity {
            zone: ZoneId::default(),
            device_id: format!("device-{}", class.as_str()),
            device_class: class,
        };
        let orchestrator = SyncOrchestrator::new(
            identity,
            settings,
            client,
            local.clone(),
            state.clone(),
            crate::events::channel(),
        );
        Device {
            store,
            local,
            state,
            orchestrator,
        }
    }

    fn device() -> Device {
        device_on(Arc::new(MemoryRecordStore::new()), SyncSettings::default(), DeviceClass::Laptop)
    }

    fn zone() -> ZoneId {
        ZoneId::default()
    }

    #[tokio::test]
    async fn test_queue_flushes_at_batch_threshold() {
        let settings = SyncSettings {
            batch_threshold: 2,
            ..Default::default()
        };
        let d = device_on(Arc::new(MemoryRecordStore::new()), settings, DeviceClass::Laptop);
        d.orchestrator.client.create_zone_if_absent(&zone()).await.unwrap();

        let first = Project::new(zone(), "Atlas", Utc::now());
        let second = Project::new(zone(), "Borealis", Utc::now());

        let flushed =
            d.orchestrator.queue_change(PendingChange::create(first.into())).await.unwrap();
        assert_eq!(flushed, None);
        assert_eq!(d.orchestrator.status().pending_count, 1);

        let flushed =
            d.orchestrator.queue_change(PendingChange::create(second.into())).await.unwrap();
        assert_eq!(flushed.map(|report| report.pushed), Some(2));
        assert_eq!(d.store.record_count(&zone()), 2);
        assert_eq!(d.orchestrator.status().pending_count, 0);
    }

    #[tokio::test]
    async fn test_expired_token_is_cleared() {
        let d = device();
        d.state.put_token(&zone(), &ChangeToken::new(b"stale".to_vec())).await.unwrap();

        let report = d.orchestrator.perform_delta_sync().await.unwrap();
        assert!(report.token_expired);
        assert_eq!(d.state.token(&zone()).await.unwrap(), None);

        let report = d.orchestrator.perform_delta_sync().await.unwrap();
        assert!(!report.token_expired);
        assert!(d.state.token(&zone()).await.unwrap().is_some());
        assert_eq!(d.store.fetch_log().last(), Some(&None));
    }

    #[tokio::test]
    async fn test_remote_entities_are_applied_and_deleted() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = device_on(store.clone(), SyncSettings::default(), DeviceClass::Desktop);
        let reader = device_on(store, SyncSettings::default(), DeviceClass::Phone);
        let mut events = reader.orchestrator.events();

        let atlas: SyncEntity = Project::new(zone(), "Atlas", Utc::now()).into();
        writer.orchestrator.client.create_zone_if_absent(&zone()).await.unwrap();
        writer.orchestrator.queue_change(PendingChange::create(atlas.clone())).await.unwrap();
        writer.orchestrator.flush_pending().await.unwrap();

        let report = reader.orchestrator.perform_delta_sync().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(reader.local.get(&atlas.entity_ref()), Some(atlas.clone()));

        writer.orchestrator.queue_change(PendingChange::delete(atlas.entity_ref())).await.unwrap();
        writer.orchestrator.flush_pending().await.unwrap();

        let report = reader.orchestrator.perform_delta_sync().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(reader.local.get(&atlas.entity_ref()), None);
        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::EntityDeletedRemotely {
                entity: atlas.entity_ref()
            }
        );
    }

    #[tokio::test]
    async fn test_settings_apply_by_field_and_scope() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = device_on(store.clone(), SyncSettings::default(), DeviceClass::Desktop);
        let reader = device_on(store, SyncSettings::default(), DeviceClass::Phone);
        writer.orchestrator.client.create_zone_if_absent(&zone()).await.unwrap();

        let now = Utc::now();
        let mut local = Settings::global(zone(), now - ChronoDuration::minutes(5));
        local.set("theme", serde_json::json!("dark"), now - ChronoDuration::minutes(5));
        local.set("font", serde_json::json!(14), now - ChronoDuration::minutes(5));
        reader.local.apply(local.into()).await.unwrap();

        let mut global = Settings::global(zone(), now);
        global.set("theme", serde_json::json!("dark"), now);
        global.set("font", serde_json::json!(16), now);
        let mut desktop_only = Settings::for_class(zone(), DeviceClass::Desktop, now);
        desktop_only.set("sidebar", serde_json::json!(true), now);
        writer.orchestrator.queue_change(PendingChange::create(global.into())).await.unwrap();
        let desktop_change = PendingChange::create(desktop_only.clone().into());
        writer.orchestrator.queue_change(desktop_change).await.unwrap();
        writer.orchestrator.flush_pending().await.unwrap();

        let mut events = reader.orchestrator.events();
        reader.orchestrator.perform_delta_sync().await.unwrap();

        let changed: Vec<SyncEvent> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|event| matches!(event, SyncEvent::SettingsChangedRemotely { .. }))
            .collect();
        assert_eq!(
            changed,
            vec![SyncEvent::SettingsChangedRemotely {
                settings_id: Settings::id_for(None),
                device_class: None,
                changed_fields: vec!["font".into()],
            }]
        );
        assert_eq!(reader.local.get(&SyncEntity::from(desktop_only).entity_ref()), None);
        assert_eq!(reader.state.settings_mark(&zone()).await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn test_other_class_settings_do_not_move_the_mark() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = device_on(store.clone(), SyncSettings::default(), DeviceClass::Desktop);
        let reader = device_on(store, SyncSettings::default(), DeviceClass::Phone);
        writer.orchestrator.client.create_zone_if_absent(&zone()).await.unwrap();

        let now = Utc::now() - ChronoDuration::minutes(10);
        let mut desktop_only = Settings::for_class(zone(), DeviceClass::Desktop, now);
        desktop_only.set("sidebar", serde_json::json!(true), now + ChronoDuration::minutes(5));
        let mut global = Settings::global(zone(), now);
        global.set("theme", serde_json::json!("dark"), now);
        let desktop_change = PendingChange::create(desktop_only.into());
        writer.orchestrator.queue_change(desktop_change).await.unwrap();
        let global_change = PendingChange::create(global.clone().into());
        writer.orchestrator.queue_change(global_change).await.unwrap();
        writer.orchestrator.flush_pending().await.unwrap();

        reader.orchestrator.perform_delta_sync().await.unwrap();
        assert_eq!(reader.state.settings_mark(&zone()).await.unwrap(), Some(now));

        global.set("theme", serde_json::json!("light"), now + ChronoDuration::minutes(2));
        let global_change = PendingChange::update(global.clone().into());
        writer.orchestrator.queue_change(global_change).await.unwrap();
        writer.orchestrator.flush_pending().await.unwrap();

        reader.orchestrator.perform_delta_sync().await.unwrap();
        let global: SyncEntity = global.into();
        assert_eq!(reader.local.get(&global.entity_ref()), Some(global));
    }

    #[tokio::test]
    async fn test_unreadable_queue_rows_are_dropped_by_sync() {
        let store = Arc::new(MemoryRecordStore::new());
        let client =
            Arc::new(RemoteStoreClient::new(store.clone(), Arc::new(PassthroughCipher), 50));
        let db = tandem_db::Database::new(tandem_db::DbConfig::in_memory()).await.unwrap();
        let db = Arc::new(db);
        let orchestrator = SyncOrchestrator::new(
            OrchestratorIdentity {
                zone: zone(),
                device_id: "device-laptop".into(),
                device_class: DeviceClass::Laptop,
            },
            SyncSettings::default(),
            client,
            db.clone(),
            db.clone(),
            crate::events::channel(),
        );

        sqlx::query(
            "INSERT INTO pending_changes
                 (id, operation, entity_kind, entity_id, zone, payload, enqueued_at)
             VALUES
                 ('broken', 'update', 'Project', 'nope', 'TandemZone', '{',
                  '2026-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        assert_eq!(db.pending_count().await.unwrap(), 1);

        orchestrator.sync().await.unwrap();
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert_eq!(orchestrator.status().pending_count, 0);
        assert_eq!(store.record_count(&zone()), 0);
    }

    #[tokio::test]
    async fn test_peer_batch_leaves_token_alone() {
        let d = device();
        let mut conversation = Conversation::new(zone(), "Trip", Utc::now());
        let message = Message::new(&conversation, MessageRole::User, "hello", Utc::now());
        conversation.append_message(message);

        let batch = ChangeBatch::new("peer", vec![conversation.clone().into()], Vec::new());
        let report = d.orchestrator.apply_peer_batch("peer", batch).await.unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(d.state.token(&zone()).await.unwrap(), None);
        assert!(d.store.fetch_log().is_empty());
        assert_eq!(d.state.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_sync_pauses_and_reports() {
        let d = device();
        let mut events = d.orchestrator.events();
        d.store.set_offline(true);

        assert!(d.orchestrator.sync().await.is_err());
        assert_eq!(d.orchestrator.status().state, SyncState::Paused);
        assert!(matches!(
            events.try_recv().unwrap(),
            SyncEvent::SyncFailed { retryable: true, .. }
        ));

        d.store.set_offline(false);
        d.orchestrator.sync().await.unwrap();
        let status = d.orchestrator.status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.last_error, None);
        assert!(status.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_notification_triggers_exactly_one_sync() {
        let d = device();
        let store = d.store.clone();
        let handle = d.orchestrator.spawn();

        handle.notify_remote_change().await.unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(store.fetch_log().len(), 1);
        assert_eq!(handle.status().state, SyncState::Stopped);
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let d = device();
        let local = d.local.clone();
        let handle = d.orchestrator.spawn();

        let atlas: SyncEntity = Project::new(zone(), "Atlas", Utc::now()).into();
        handle.queue_change(PendingChange::create(atlas.clone())).await.unwrap();
        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.flush.pushed, 1);

        let batch = ChangeBatch::new("peer", Vec::new(), vec![atlas.entity_ref()]);
        local.apply(atlas.clone()).await.unwrap();
        handle.handle_batch("peer", batch).await.unwrap();
        assert_eq!(local.get(&atlas.entity_ref()), None);

        handle.shutdown().await.unwrap();
        assert!(handle.sync_now().await.is_err());
    }
}
