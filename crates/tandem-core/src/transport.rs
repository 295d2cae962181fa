//! # Transport Value Types
//!
//! Ranking rules and health records for the network paths between devices.
//! The probing and selection machinery lives in `tandem-sync`; this module
//! only holds the facts every component agrees on.
//!
//! ## Ranking
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  rank  transport       latency ceiling   probed?                        │
//! │  ────  ─────────────   ───────────────   ───────                        │
//! │   0    Direct          10 ms             yes  (wired bridge)            │
//! │   1    LocalNetwork    50 ms             yes  (mDNS peers)              │
//! │   2    VpnOverlay      300 ms            yes  (overlay hostnames)       │
//! │   3    CloudRelay      -                 no   (always available)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// =============================================================================
// Transport Kind
// =============================================================================

/// A concrete network path. Declaration order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Direct,
    LocalNetwork,
    VpnOverlay,
    CloudRelay,
}

impl TransportKind {
    /// Every transport, best first.
    pub const ALL: [TransportKind; 4] = [
        TransportKind::Direct,
        TransportKind::LocalNetwork,
        TransportKind::VpnOverlay,
        TransportKind::CloudRelay,
    ];

    /// Fixed rank. Lower is preferred.
    pub fn priority(&self) -> u8 {
        match self {
            TransportKind::Direct => 0,
            TransportKind::LocalNetwork => 1,
            TransportKind::VpnOverlay => 2,
            TransportKind::CloudRelay => 3,
        }
    }

    /// Upper bound of the nominal latency class. `None` means unbounded.
    pub fn latency_ceiling_ms(&self) -> Option<u64> {
        match self {
            TransportKind::Direct => Some(10),
            TransportKind::LocalNetwork => Some(50),
            TransportKind::VpnOverlay => Some(300),
            TransportKind::CloudRelay => None,
        }
    }

    /// Cloud relay needs no reachability probe.
    pub fn requires_probe(&self) -> bool {
        !matches!(self, TransportKind::CloudRelay)
    }

    /// A connection slower than the class ceiling is probably routed through
    /// some other path and does not count as this transport.
    pub fn is_plausible_latency(&self, latency_ms: u64) -> bool {
        self.latency_ceiling_ms()
            .map(|ceiling| latency_ms <= ceiling)
            .unwrap_or(true)
    }

    /// Transports strictly better than this one.
    pub fn better_than(&self) -> impl Iterator<Item = TransportKind> + '_ {
        TransportKind::ALL
            .into_iter()
            .filter(move |t| t.priority() < self.priority())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::LocalNetwork => "local_network",
            TransportKind::VpnOverlay => "vpn_overlay",
            TransportKind::CloudRelay => "cloud_relay",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "bridge" | "thunderbolt" => Ok(TransportKind::Direct),
            "local_network" | "lan" | "local" => Ok(TransportKind::LocalNetwork),
            "vpn_overlay" | "vpn" | "overlay" => Ok(TransportKind::VpnOverlay),
            "cloud_relay" | "cloud" => Ok(TransportKind::CloudRelay),
            other => Err(CoreError::InvalidValue {
                field: "transport".into(),
                value: other.into(),
            }),
        }
    }
}

// =============================================================================
// Transport State
// =============================================================================

/// Per-transport lifecycle.
///
/// ```text
/// Unprobed ──probe ok──► Available ──check ok──► Healthy ◄──check ok──┐
///                            ▲                      │                  │
///                            │                  check fails            │
///                        probe ok                   ▼                  │
///                            │                  Degraded ──────────────┘
///                       Unavailable ◄── threshold ──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Unprobed,
    Available,
    Healthy,
    Degraded,
    Unavailable,
}

impl TransportState {
    /// Member of the available set.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            TransportState::Available | TransportState::Healthy | TransportState::Degraded
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Unprobed => write!(f, "unprobed"),
            TransportState::Available => write!(f, "available"),
            TransportState::Healthy => write!(f, "healthy"),
            TransportState::Degraded => write!(f, "degraded"),
            TransportState::Unavailable => write!(f, "unavailable"),
        }
    }
}

// =============================================================================
// Probe / Health Records
// =============================================================================

/// Outcome of probing one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportProbeResult {
    pub transport: TransportKind,
    pub available: bool,
    /// Wall-clock time to connection-ready.
    pub latency_ms: Option<u64>,
    /// Endpoint that answered fastest.
    pub endpoint: Option<String>,
    pub probed_at: DateTime<Utc>,
}

impl TransportProbeResult {
    pub fn reachable(
        transport: TransportKind,
        latency_ms: u64,
        endpoint: impl Into<String>,
    ) -> Self {
        TransportProbeResult {
            transport,
            available: true,
            latency_ms: Some(latency_ms),
            endpoint: Some(endpoint.into()),
            probed_at: Utc::now(),
        }
    }

    pub fn unreachable(transport: TransportKind) -> Self {
        TransportProbeResult {
            transport,
            available: false,
            latency_ms: None,
            endpoint: None,
            probed_at: Utc::now(),
        }
    }

    /// Synthetic result for the cloud relay, which is never probed.
    pub fn cloud_relay() -> Self {
        TransportProbeResult {
            transport: TransportKind::CloudRelay,
            available: true,
            latency_ms: None,
            endpoint: None,
            probed_at: Utc::now(),
        }
    }
}

/// Rolling health of one transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHealthStatus {
    pub transport: TransportKind,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub average_latency_ms: Option<f64>,
}

impl TransportHealthStatus {
    pub fn new(transport: TransportKind) -> Self {
        TransportHealthStatus {
            transport,
            healthy: false,
            consecutive_failures: 0,
            last_checked_at: None,
            average_latency_ms: None,
        }
    }
}
