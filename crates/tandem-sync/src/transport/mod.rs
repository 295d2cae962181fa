//! # Transport Subsystem
//!
//! Decides which network path carries sync traffic between this device and
//! its peers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  TransportSelector worker (selector.rs)                                │
//! │    owns SelectorState ── states, health, endpoints, active             │
//! │                                                                         │
//! │    start ─────────► probe_all(ALL) ──► select()                        │
//! │    health tick ───► probe(active)  ──► record_health ──► failover?     │
//! │    upgrade tick ──► probe_all(better_than(active)) ──► upgrade?        │
//! │                                                                         │
//! │  Prober (probe.rs)                                                     │
//! │    Direct        configured host:port list                             │
//! │    LocalNetwork  peers from mDNS discovery                             │
//! │    VpnOverlay    overlay hostnames, resolved by the overlay's DNS      │
//! │    CloudRelay    never probed, always available                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod probe;
pub mod selector;

pub use probe::{Prober, TransportProber};
pub use selector::{
    ChangeReason, SelectorState, TransportChange, TransportSelector, TransportSelectorHandle,
    TransportSnapshot,
};
