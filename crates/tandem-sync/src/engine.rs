//! # Sync Engine
//!
//! Wires every component together and owns their lifetimes.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. RemoteStoreClient   record store + cipher                           │
//! │  2. Discovery           advertise + browse (mDNS), optional             │
//! │  3. TransportSelector   probes Direct / LAN / VPN, cloud as fallback    │
//! │  4. Orchestrator        token, queue, merges, timers                    │
//! │  5. Peer server         /sync on the peer port, feeds the orchestrator  │
//! │  6. Subscription        store wakeups ──► notify_remote_change()        │
//! │  7. First delta sync                                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Steps 2, 5 and 6 are allowed to fail: the engine then runs without
//! local peers or without push wakeups, and polling covers the gap.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::crypto::{AesGcmCipher, Cipher, PassthroughCipher};
use crate::discovery::{
    DiscoveredPeer, DiscoveryHandle, DiscoveryIdentity, DiscoveryService, PeerDirectory,
    StaticPeers,
};
use crate::error::{SyncError, SyncResult};
use crate::events::{self, SyncEvent, SyncStatus};
use crate::local::{LocalStore, SyncStateStore};
use crate::orchestrator::{
    OrchestratorIdentity, PeerFanout, SyncOrchestrator, SyncOrchestratorHandle, SyncTrigger,
};
use crate::peer::{PeerClient, PeerIdentity, PeerServer, PeerServerHandle};
use crate::remote::{RecordStore, RemoteStoreClient, ZoneNotification};
use crate::transport::{Prober, TransportProber, TransportSelector, TransportSelectorHandle};
use tandem_core::{DeviceProfile, ZoneId};

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    device: Option<DeviceProfile>,
    record_store: Option<Arc<dyn RecordStore>>,
    local: Option<Arc<dyn LocalStore>>,
    state: Option<Arc<dyn SyncStateStore>>,
    cipher: Option<Arc<dyn Cipher>>,
    prober: Option<Arc<dyn Prober>>,
    peers: Option<Arc<dyn PeerDirectory>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncEngineBuilder {
            config,
            device: None,
            record_store: None,
            local: None,
            state: None,
            cipher: None,
            prober: None,
            peers: None,
        }
    }

    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    pub fn with_local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_state_store(mut self, state: Arc<dyn SyncStateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Overrides the cipher derived from `account.encryption_key`.
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Replaces the TCP prober.
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Uses a fixed peer list instead of mDNS.
    pub fn with_peer_directory(mut self, peers: Arc<dyn PeerDirectory>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;

        let device = self.device.ok_or(SyncError::MissingDeviceId)?;
        let record_store = self
            .record_store
            .ok_or_else(|| SyncError::InvalidConfig("Record store required".into()))?;
        let local = self
            .local
            .ok_or_else(|| SyncError::InvalidConfig("Local store required".into()))?;
        let state = self
            .state
            .ok_or_else(|| SyncError::InvalidConfig("Sync state store required".into()))?;

        let cipher: Arc<dyn Cipher> = match (self.cipher, &self.config.account.encryption_key) {
            (Some(cipher), _) => cipher,
            (None, Some(key)) => Arc::new(AesGcmCipher::from_base64_key(key)?),
            (None, None) => {
                warn!("No encryption key configured, records are stored in the clear");
                Arc::new(PassthroughCipher)
            }
        };

        Ok(SyncEngine {
            config: self.config,
            device,
            record_store,
            local,
            state,
            cipher,
            prober: self.prober,
            peers: self.peers,
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A configured, not yet running engine.
pub struct SyncEngine {
    config: SyncConfig,
    device: DeviceProfile,
    record_store: Arc<dyn RecordStore>,
    local: Arc<dyn LocalStore>,
    state: Arc<dyn SyncStateStore>,
    cipher: Arc<dyn Cipher>,
    prober: Option<Arc<dyn Prober>>,
    peers: Option<Arc<dyn PeerDirectory>>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    /// Starts every component and requests the first delta sync.
    pub async fn start(self) -> SyncResult<SyncEngineHandle> {
        let config = self.config;
        let zone = config.zone();

        info!(
            device_id = %self.device.device_id,
            device_class = %self.device.device_class.as_str(),
            zone = %zone,
            store = %config.remote.url,
            "Starting sync engine"
        );

        let client = Arc::new(RemoteStoreClient::new(
            self.record_store,
            self.cipher,
            config.remote.page_size,
        ));

        // Discovery
        let discovery = match self.peers {
            Some(_) => None,
            None if config.discovery.mdns_enabled => {
                let identity = DiscoveryIdentity {
                    device_id: self.device.device_id.clone(),
                    device_name: self.device.display_name.clone(),
                    device_class: self.device.device_class,
                    account_id: config.account_id().to_string(),
                    port: config.transport.peer_port,
                };
                match DiscoveryService::start(&config.discovery, identity) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(error = %e, "Local discovery unavailable");
                        None
                    }
                }
            }
            None => None,
        };
        let directory: Arc<dyn PeerDirectory> = match (&self.peers, &discovery) {
            (Some(peers), _) => peers.clone(),
            (None, Some(handle)) => handle.directory(),
            (None, None) => Arc::new(StaticPeers::default()),
        };

        // Transport selection
        let prober = self.prober.unwrap_or_else(|| {
            let prober = TransportProber::new(config.transport.clone());
            Arc::new(prober.with_directory(directory.clone()))
        });
        let selector = TransportSelector::spawn(prober, &config.transport);

        // Orchestrator
        let peer_identity = PeerIdentity {
            device_id: self.device.device_id.clone(),
            device_name: self.device.display_name.clone(),
            account_id: config.account_id().to_string(),
        };
        let events = events::channel();
        let orchestrator = SyncOrchestrator::new(
            OrchestratorIdentity {
                zone: zone.clone(),
                device_id: self.device.device_id.clone(),
                device_class: self.device.device_class,
            },
            config.sync.clone(),
            client.clone(),
            self.local,
            self.state,
            events.clone(),
        )
        .with_transport(selector.clone())
        .with_peers(PeerFanout::new(
            PeerClient::new(peer_identity.clone(), &config.peer),
            directory.clone(),
        ))
        .spawn();

        // Peer link
        let peer_server = if config.peer.enabled {
            let server = PeerServer::new(
                &config.peer,
                config.transport.peer_port,
                peer_identity,
                Arc::new(orchestrator.clone()),
            );
            match server.start().await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Peer link unavailable");
                    None
                }
            }
        } else {
            None
        };

        // Store wakeups
        if let Err(e) = client.subscribe(&zone).await {
            warn!(zone = %zone, error = %e, "Subscription failed, relying on polling");
        }
        let listener =
            NotificationListener::spawn(client.notifications(), zone, orchestrator.clone());

        orchestrator.request_sync(SyncTrigger::Startup).await?;
        info!("Sync engine started");

        Ok(SyncEngineHandle {
            orchestrator,
            selector,
            events,
            directory,
            discovery,
            peer_server,
            listener,
        })
    }
}

// =============================================================================
// Notification Listener
// =============================================================================

/// Turns store wakeups for our zone into delta syncs.
struct NotificationListener {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl NotificationListener {
    fn spawn(
        mut notifications: broadcast::Receiver<ZoneNotification>,
        zone: ZoneId,
        orchestrator: SyncOrchestratorHandle,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = notifications.recv() => match received {
                        Ok(notification) if notification.zone == zone => {
                            debug!(zone = %zone, "Store reported changes");
                            if orchestrator.notify_remote_change().await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed wakeups collapse into one sync.
                            debug!(skipped, "Missed store notifications");
                            if orchestrator.notify_remote_change().await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("Notification listener stopped");
        });

        NotificationListener { shutdown_tx, task }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            debug!(error = %e, "Notification listener ended abnormally");
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// A running engine.
pub struct SyncEngineHandle {
    orchestrator: SyncOrchestratorHandle,
    selector: TransportSelectorHandle,
    events: broadcast::Sender<SyncEvent>,
    directory: Arc<dyn PeerDirectory>,
    discovery: Option<DiscoveryHandle>,
    peer_server: Option<PeerServerHandle>,
    listener: NotificationListener,
}

impl SyncEngineHandle {
    pub fn orchestrator(&self) -> &SyncOrchestratorHandle {
        &self.orchestrator
    }

    pub fn transport(&self) -> &TransportSelectorHandle {
        &self.selector
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.orchestrator.status()
    }

    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.directory.peers()
    }

    /// Address the peer link listens on, if it started.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_server.as_ref().map(PeerServerHandle::local_addr)
    }

    /// Stops wakeups, health checks, discovery and the peer link, then lets
    /// the orchestrator finish what it is doing.
    pub async fn stop(self) -> SyncResult<()> {
        info!("Stopping sync engine");

        self.listener.stop().await;
        if let Err(e) = self.selector.shutdown().await {
            debug!(error = %e, "Transport selector already stopped");
        }
        if let Some(discovery) = self.discovery {
            discovery.shutdown().await;
        }
        if let Some(server) = self.peer_server {
            server.shutdown().await;
        }
        self.orchestrator.shutdown().await?;

        info!("Sync engine stopped");
        Ok(())
    }
}
