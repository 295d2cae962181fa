//! # Discovery Module
//!
//! Finds other devices of the same account on the local network with mDNS.
//!
//! ## Discovery Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Every device both advertises and browses _tandem-sync._tcp.local.     │
//! │                                                                         │
//! │  ┌─────────────┐   advertise (port 18790)     ┌─────────────┐           │
//! │  │   Studio    │ ───────────────────────────▶ │   Laptop    │           │
//! │  │             │ ◀─────────────────────────── │             │           │
//! │  └─────────────┘   TXT: device_id, name,      └─────────────┘           │
//! │                         class, account                                  │
//! │                                                                         │
//! │  ServiceFound     ignored: name only, no address yet                   │
//! │  ServiceResolved  registered if it has an address, the same account,   │
//! │                   and is not this device                               │
//! │  ServiceRemoved   dropped                                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The prober reads the resolved peers through [`PeerDirectory`] and treats
//! their addresses as the local-network endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoverySettings;
use crate::error::{SyncError, SyncResult};
use tandem_core::DeviceClass;

const PROP_DEVICE_ID: &str = "device_id";
const PROP_NAME: &str = "name";
const PROP_CLASS: &str = "class";
const PROP_ACCOUNT: &str = "account";

// =============================================================================
// Peers
// =============================================================================

/// A device found on the local network.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub device_id: String,
    pub name: String,
    pub class: Option<DeviceClass>,
    /// mDNS full service name, the key for removal events.
    pub fullname: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeer {
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    /// Peer link URL on the first known address.
    pub fn sync_url(&self) -> Option<String> {
        self.socket_addrs()
            .first()
            .map(|addr| format!("ws://{}/sync", addr))
    }
}

/// Read access to the peers currently known on the local network.
pub trait PeerDirectory: Send + Sync {
    fn peers(&self) -> Vec<DiscoveredPeer>;

    fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.peers().iter().flat_map(|peer| peer.socket_addrs()).collect()
    }
}

/// Fixed peer list, for wiring without mDNS.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: Vec<DiscoveredPeer>,
}

impl StaticPeers {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        let now = Utc::now();
        let peers = addrs
            .into_iter()
            .enumerate()
            .map(|(i, addr)| DiscoveredPeer {
                device_id: format!("static-{}", i),
                name: addr.to_string(),
                class: None,
                fullname: addr.to_string(),
                addresses: vec![addr.ip()],
                port: addr.port(),
                last_seen: now,
            })
            .collect();
        StaticPeers { peers }
    }
}

impl PeerDirectory for StaticPeers {
    fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.clone()
    }
}

/// Who this device says it is on the network.
#[derive(Debug, Clone)]
pub struct DiscoveryIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_class: DeviceClass,
    pub account_id: String,
    pub port: u16,
}

/// Peers resolved so far, keyed by mDNS full name.
#[derive(Default)]
struct PeerTable {
    peers: RwLock<HashMap<String, DiscoveredPeer>>,
}

impl PeerDirectory for PeerTable {
    fn peers(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        peers
    }
}

impl PeerTable {
    fn apply(&self, identity: &DiscoveryIdentity, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                if let Some(peer) = accept_peer(identity, &info) {
                    let known = self.peers.write().insert(peer.fullname.clone(), peer.clone());
                    if known.is_none() {
                        info!(
                            device_id = %peer.device_id,
                            name = %peer.name,
                            addresses = ?peer.addresses,
                            "Discovered peer"
                        );
                    }
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                if let Some(peer) = self.peers.write().remove(&fullname) {
                    info!(device_id = %peer.device_id, "Peer left the network");
                }
            }
            ServiceEvent::ServiceFound(_, fullname) => {
                trace!(fullname = %fullname, "Service found, waiting for resolution");
            }
            _ => {}
        }
    }
}

/// Turns a resolved service into a peer, or rejects it.
fn accept_peer(identity: &DiscoveryIdentity, info: &ServiceInfo) -> Option<DiscoveredPeer> {
    let fullname = info.get_fullname().to_string();

    let Some(device_id) = info.get_property_val_str(PROP_DEVICE_ID) else {
        debug!(fullname = %fullname, "Ignoring service without device id");
        return None;
    };
    if device_id == identity.device_id {
        return None;
    }
    if info.get_property_val_str(PROP_ACCOUNT) != Some(identity.account_id.as_str()) {
        debug!(fullname = %fullname, "Ignoring device from another account");
        return None;
    }

    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    if addresses.is_empty() {
        debug!(fullname = %fullname, "Ignoring service with no address");
        return None;
    }
    addresses.sort();

    Some(DiscoveredPeer {
        device_id: device_id.to_string(),
        name: info
            .get_property_val_str(PROP_NAME)
            .unwrap_or(device_id)
            .to_string(),
        class: info
            .get_property_val_str(PROP_CLASS)
            .and_then(|class| class.parse().ok()),
        fullname,
        addresses,
        port: info.get_port(),
        last_seen: Utc::now(),
    })
}

/// Builds this device's advertisement. Addresses are filled in by the
/// daemon from the active interfaces.
fn advertisement(service_type: &str, identity: &DiscoveryIdentity) -> SyncResult<ServiceInfo> {
    let properties = HashMap::from([
        (PROP_DEVICE_ID.to_string(), identity.device_id.clone()),
        (PROP_NAME.to_string(), identity.device_name.clone()),
        (PROP_CLASS.to_string(), identity.device_class.as_str().to_string()),
        (PROP_ACCOUNT.to_string(), identity.account_id.clone()),
    ]);
    let host_name = format!("{}.local.", identity.device_id);

    let info = ServiceInfo::new(
        service_type,
        &identity.device_id,
        &host_name,
        "",
        identity.port,
        Some(properties),
    )?;
    Ok(info.enable_addr_auto())
}

// =============================================================================
// Discovery Service
// =============================================================================

/// Handle for the running advertiser and browser.
pub struct DiscoveryHandle {
    daemon: ServiceDaemon,
    service_type: String,
    fullname: String,
    table: Arc<PeerTable>,
    shutdown_tx: mpsc::Sender<()>,
    listener: JoinHandle<()>,
}

impl DiscoveryHandle {
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.table.peers()
    }

    /// Shared view of the peer table for the prober and peer client.
    pub fn directory(&self) -> Arc<dyn PeerDirectory> {
        self.table.clone()
    }

    /// Withdraws the advertisement and stops browsing.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;

        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!(error = %e, "Failed to withdraw mDNS advertisement");
        }
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!(error = %e, "Failed to stop mDNS browse");
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
        if let Err(e) = self.listener.await {
            debug!(error = %e, "Discovery listener ended abnormally");
        }
        info!("Discovery stopped");
    }
}

pub struct DiscoveryService;

impl DiscoveryService {
    /// Registers this device and starts browsing for others.
    pub fn start(
        settings: &DiscoverySettings,
        identity: DiscoveryIdentity,
    ) -> SyncResult<DiscoveryHandle> {
        if !settings.mdns_enabled {
            return Err(SyncError::Discovery("mDNS is disabled".into()));
        }

        let daemon = ServiceDaemon::new()?;
        let info = advertisement(&settings.service_type, &identity)?;
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        let events = daemon.browse(&settings.service_type)?;

        info!(
            service_type = %settings.service_type,
            port = identity.port,
            device_id = %identity.device_id,
            "Advertising on the local network"
        );

        let table = Arc::new(PeerTable::default());
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let listener_table = table.clone();

        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv_async() => match event {
                        Ok(event) => listener_table.apply(&identity, event),
                        Err(_) => {
                            warn!("mDNS event channel closed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(DiscoveryHandle {
            daemon,
            service_type: settings.service_type.clone(),
            fullname,
            table,
            shutdown_tx,
            listener,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::MDNS_SERVICE_TYPE;

    fn identity() -> DiscoveryIdentity {
        DiscoveryIdentity {
            device_id: "dev-studio".into(),
            device_name: "Studio".into(),
            device_class: DeviceClass::Desktop,
            account_id: "acct-1".into(),
            port: 18790,
        }
    }

    fn service(device_id: &str, account: &str, ip: &str) -> ServiceInfo {
        let properties = HashMap::from([
            (PROP_DEVICE_ID.to_string(), device_id.to_string()),
            (PROP_NAME.to_string(), format!("{} name", device_id)),
            (PROP_CLASS.to_string(), "laptop".to_string()),
            (PROP_ACCOUNT.to_string(), account.to_string()),
        ]);
        ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            device_id,
            &format!("{}.local.", device_id),
            ip,
            18790,
            Some(properties),
        )
        .unwrap()
    }

    #[test]
    fn test_resolved_peer_is_registered() {
        let table = PeerTable::default();
        let laptop = service("dev-laptop", "acct-1", "192.168.1.20");
        table.apply(&identity(), ServiceEvent::ServiceResolved(laptop));

        let peers = table.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].device_id, "dev-laptop");
        assert_eq!(peers[0].class, Some(DeviceClass::Laptop));
        assert_eq!(
            table.local_endpoints(),
            vec!["192.168.1.20:18790".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(peers[0].sync_url().as_deref(), Some("ws://192.168.1.20:18790/sync"));
    }

    #[test]
    fn test_rejected_services() {
        let table = PeerTable::default();
        let me = identity();

        let seen = |id, account, addr| ServiceEvent::ServiceResolved(service(id, account, addr));
        table.apply(&me, seen("dev-studio", "acct-1", "192.168.1.5"));
        table.apply(&me, seen("dev-other", "acct-2", "192.168.1.6"));
        table.apply(&me, seen("dev-laptop", "acct-1", ""));
        table.apply(
            &me,
            ServiceEvent::ServiceFound(
                MDNS_SERVICE_TYPE.into(),
                "dev-phone._tandem-sync._tcp.local.".into(),
            ),
        );

        assert!(table.peers().is_empty());
    }

    #[test]
    fn test_removed_peer_is_dropped() {
        let table = PeerTable::default();
        let info = service("dev-laptop", "acct-1", "192.168.1.20");
        let fullname = info.get_fullname().to_string();

        table.apply(&identity(), ServiceEvent::ServiceResolved(info));
        assert_eq!(table.peers().len(), 1);

        table.apply(&identity(), ServiceEvent::ServiceRemoved(MDNS_SERVICE_TYPE.into(), fullname));
        assert!(table.peers().is_empty());
    }

    #[test]
    fn test_advertisement_carries_identity() {
        let info = advertisement(MDNS_SERVICE_TYPE, &identity()).unwrap();
        assert_eq!(info.get_port(), 18790);
        assert_eq!(info.get_property_val_str(PROP_ACCOUNT), Some("acct-1"));
        assert_eq!(info.get_property_val_str(PROP_CLASS), Some("desktop"));
        assert!(info.get_fullname().starts_with("dev-studio."));
    }

    #[test]
    fn test_static_peers() {
        let addr: SocketAddr = "10.0.0.7:18790".parse().unwrap();
        assert_eq!(StaticPeers::new(vec![addr]).local_endpoints(), vec![addr]);
    }
}
