//! # tandem-core: Sync Domain Model for Tandem
//!
//! Entities, transport facts and conflict resolution for the Tandem
//! cross-device sync engine. Everything here is pure: no I/O, no clocks
//! beyond what callers pass in, no async.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tandem Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                tandem-sync (engine + tandemd)                   │   │
//! │  │  orchestrator ── resolver ── remote store ── transport ── peer  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tandem-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   merge   │  │  record   │  │ transport │  │   │
//! │  │   │ SyncEntity│  │  union /  │  │  Record   │  │   rank    │  │   │
//! │  │   │ Pending   │  │  LWW /    │  │  FieldVal │  │  health   │  │   │
//! │  │   │ Change    │  │  settings │  │  Key      │  │  probes   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   plain data and functions; callers supply clocks and storage   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 tandem-db (Sync State Storage)                  │   │
//! │  │        change tokens, pending queue, device profile (SQLite)    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Synchronized entities, change tokens, pending changes
//! - [`merge`] - Conflict resolution per entity kind
//! - [`record`] - Loosely-typed remote record shape
//! - [`transport`] - Transport ranking and health records
//! - [`device`] - Device identity and class
//! - [`error`] - `CoreError`
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use tandem_core::merge::merge_conversations;
//! use tandem_core::{Conversation, Message, MessageRole, ZoneId};
//!
//! let t0 = Utc::now();
//! let base = Conversation::new(ZoneId::default(), "Notes", t0);
//!
//! let mut laptop = base.clone();
//! laptop.append_message(Message::new(&base, MessageRole::User, "a", t0 + Duration::seconds(1)));
//! let mut phone = base.clone();
//! phone.append_message(Message::new(&base, MessageRole::User, "b", t0 + Duration::seconds(2)));
//!
//! let merged = merge_conversations(&laptop, &phone);
//! assert_eq!(merged.messages.len(), 2);
//! assert_eq!(merged.messages[0].content, "a");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod device;
pub mod error;
pub mod merge;
pub mod record;
pub mod transport;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use device::{DeviceClass, DeviceProfile};
pub use error::{CoreError, CoreResult};
pub use merge::{MergeContext, MergeOutcome, SettingsApply};
pub use record::{DeletedRecord, FieldValue, Record, RecordKey};
pub use transport::{TransportHealthStatus, TransportKind, TransportProbeResult, TransportState};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Merge-and-resave rounds after the first rejected save of an entity.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Consecutive health-check failures before a transport is abandoned.
pub const FAILURE_THRESHOLD: u32 = 3;

/// TCP port the peer sync listener binds by default.
pub const DEFAULT_PEER_PORT: u16 = 18790;

/// DNS-SD service type advertised on the local network.
pub const MDNS_SERVICE_TYPE: &str = "_tandem-sync._tcp.local.";
