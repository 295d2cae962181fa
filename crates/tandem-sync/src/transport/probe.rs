//! # Transport Prober
//!
//! Measures whether a transport can reach a peer right now.
//!
//! A probe opens TCP connections to every candidate endpoint of the
//! transport at once and keeps the first one to become ready. The others are
//! dropped, which tears their sockets down. The whole probe, name
//! resolution included, races the transport's timeout.
//!
//! ```text
//! probe(LocalNetwork)
//!   targets ──── 192.168.1.20:18790 ──┐
//!             ── 192.168.1.31:18790 ──┼── first ready wins ── latency ≤ 50 ms? ── reachable
//!             ── [fe80::3]:18790 ─────┘                                   │
//!   timeout (1000 ms) ────────────────────────────────────────────────────┴──── unreachable
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::TransportSettings;
use crate::discovery::PeerDirectory;
use tandem_core::{TransportKind, TransportProbeResult};

/// Reachability check for one transport.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, kind: TransportKind) -> TransportProbeResult;

    /// Probes several transports concurrently, each under its own timeout.
    async fn probe_all(&self, kinds: &[TransportKind]) -> Vec<TransportProbeResult> {
        join_all(kinds.iter().map(|kind| self.probe(*kind))).await
    }
}

/// TCP connect prober over the configured and discovered endpoints.
pub struct TransportProber {
    settings: TransportSettings,
    directory: Option<Arc<dyn PeerDirectory>>,
}

impl TransportProber {
    pub fn new(settings: TransportSettings) -> Self {
        TransportProber {
            settings,
            directory: None,
        }
    }

    /// Uses discovered peers as the local-network endpoints.
    pub fn with_directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// `host:port` targets for a transport. Names are resolved when
    /// connecting.
    fn targets(&self, kind: TransportKind) -> Vec<String> {
        let port = self.settings.peer_port;
        match kind {
            TransportKind::Direct => self
                .settings
                .direct_endpoints
                .iter()
                .map(|endpoint| with_default_port(endpoint, port))
                .collect(),
            TransportKind::LocalNetwork => self
                .directory
                .as_ref()
                .map(|directory| {
                    directory
                        .local_endpoints()
                        .into_iter()
                        .map(|addr| addr.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            TransportKind::VpnOverlay => self
                .settings
                .vpn_hostnames
                .iter()
                .map(|host| with_default_port(host, port))
                .collect(),
            TransportKind::CloudRelay => Vec::new(),
        }
    }

    /// Connects to every target and returns the first to succeed.
    async fn race(&self, kind: TransportKind, started: Instant) -> Option<(SocketAddr, u64)> {
        let targets = self.targets(kind);
        if targets.is_empty() {
            trace!(transport = %kind, "No endpoints to probe");
            return None;
        }

        let mut attempts: FuturesUnordered<_> = targets
            .into_iter()
            .map(|target| async move {
                let result = TcpStream::connect(target.as_str()).await;
                (target, result)
            })
            .collect();

        while let Some((target, result)) = attempts.next().await {
            match result.and_then(|stream| stream.peer_addr()) {
                Ok(addr) => return Some((addr, started.elapsed().as_millis() as u64)),
                Err(e) => {
                    trace!(transport = %kind, target = %target, error = %e, "Endpoint unreachable")
                }
            }
        }
        None
    }
}

#[async_trait]
impl Prober for TransportProber {
    async fn probe(&self, kind: TransportKind) -> TransportProbeResult {
        let Some(limit) = self.settings.probe_timeout(kind) else {
            return TransportProbeResult::cloud_relay();
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(limit, self.race(kind, started)).await {
            Ok(Some((addr, latency_ms))) if kind.is_plausible_latency(latency_ms) => {
                TransportProbeResult::reachable(kind, latency_ms, addr.to_string())
            }
            Ok(Some((addr, latency_ms))) => {
                debug!(
                    transport = %kind,
                    %addr,
                    latency_ms,
                    "Latency too high for transport class"
                );
                TransportProbeResult::unreachable(kind)
            }
            Ok(None) => TransportProbeResult::unreachable(kind),
            Err(_) => {
                trace!(transport = %kind, timeout_ms = limit.as_millis() as u64, "Probe timed out");
                TransportProbeResult::unreachable(kind)
            }
        };

        debug!(
            transport = %kind,
            available = result.available,
            latency_ms = ?result.latency_ms,
            "Probe finished"
        );
        result
    }
}

/// Appends the peer port to entries that carry none.
fn with_default_port(endpoint: &str, port: u16) -> String {
    if endpoint.parse::<SocketAddr>().is_ok() {
        return endpoint.to_string();
    }
    match endpoint.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => endpoint.to_string(),
        _ if endpoint.contains(':') => format!("[{}]:{}", endpoint.trim_matches(['[', ']']), port),
        _ => format!("{}:{}", endpoint, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticPeers;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// A port nothing listens on.
    async fn closed_port() -> SocketAddr {
        let (listener, addr) = listener().await;
        drop(listener);
        addr
    }

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("10.0.0.2", 18790), "10.0.0.2:18790");
        assert_eq!(with_default_port("10.0.0.2:9000", 18790), "10.0.0.2:9000");
        assert_eq!(with_default_port("studio.local", 18790), "studio.local:18790");
        assert_eq!(with_default_port("fe80::1", 18790), "[fe80::1]:18790");
        assert_eq!(with_default_port("[fe80::1]:9000", 18790), "[fe80::1]:9000");
    }

    #[tokio::test]
    async fn test_cloud_relay_is_never_probed() {
        let prober = TransportProber::new(TransportSettings::default());
        let result = prober.probe(TransportKind::CloudRelay).await;
        assert!(result.available);
        assert_eq!(result.endpoint, None);
    }

    #[tokio::test]
    async fn test_local_peer_reachable() {
        let (_listener, addr) = listener().await;
        let dead = closed_port().await;
        let directory = Arc::new(StaticPeers::new(vec![dead, addr]));
        let prober = TransportProber::new(TransportSettings::default()).with_directory(directory);

        let result = prober.probe(TransportKind::LocalNetwork).await;
        assert!(result.available);
        assert_eq!(result.endpoint, Some(addr.to_string()));
        assert!(result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_vpn_hostname_uses_peer_port() {
        let (_listener, addr) = listener().await;
        let settings = TransportSettings {
            vpn_hostnames: vec!["127.0.0.1".into()],
            peer_port: addr.port(),
            ..Default::default()
        };

        let result = TransportProber::new(settings).probe(TransportKind::VpnOverlay).await;
        assert!(result.available);
    }

    #[tokio::test]
    async fn test_unreachable_transports() {
        let dead = closed_port().await;
        let settings = TransportSettings {
            direct_endpoints: vec![dead.to_string()],
            ..Default::default()
        };
        let prober = TransportProber::new(settings);

        let results = prober
            .probe_all(&[
                TransportKind::Direct,
                TransportKind::LocalNetwork,
                TransportKind::CloudRelay,
            ])
            .await;
        let available: Vec<_> = results.iter().map(|r| (r.transport, r.available)).collect();
        assert_eq!(
            available,
            vec![
                (TransportKind::Direct, false),
                (TransportKind::LocalNetwork, false),
                (TransportKind::CloudRelay, true),
            ]
        );
    }
}
