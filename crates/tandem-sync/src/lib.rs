//! # tandem-sync: Sync Engine for Tandem
//!
//! Keeps conversations, knowledge items, projects and settings identical
//! across one account's devices, through a cloud record store and, when
//! devices can see each other, directly.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncEngine                                     │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncOrchestrator (worker)                     │  │
//! │  │                                                                  │  │
//! │  │  performs delta syncs, owns change token + pending queue         │  │
//! │  │  one command at a time: sync / queue / flush / peer batch        │  │
//! │  └──────┬──────────────────────┬───────────────────────┬────────────┘  │
//! │         ▼                      ▼                       ▼               │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌───────────────────────┐   │
//! │  │ Remote store   │  │ Transport        │  │ Local collaborators   │   │
//! │  │                │  │ selector         │  │                       │   │
//! │  │ client + codec │  │                  │  │ LocalStore            │   │
//! │  │ + resolver     │  │ probe, health,   │  │ SyncStateStore        │   │
//! │  │ cloud / memory │  │ failover/upgrade │  │ (Database or memory)  │   │
//! │  └────────────────┘  └──────────────────┘  └───────────────────────┘   │
//! │                                                                         │
//! │  ┌────────────────┐  ┌──────────────────┐                              │
//! │  │ Discovery      │  │ Peer link        │                              │
//! │  │ mDNS advertise │  │ axum /sync +     │                              │
//! │  │ + browse       │  │ push client      │                              │
//! │  └────────────────┘  └──────────────────┘                              │
//! │                                                                         │
//! │  EVENTS (broadcast): entity deleted remotely, settings changed         │
//! │  remotely, sync completed, sync failed, conflict unresolved,           │
//! │  transport changed                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types
//! - [`crypto`] - Record payload encryption
//! - [`remote`] - Record store trait, client, cloud and memory stores
//! - [`resolver`] - Merge-and-retry saves
//! - [`outbox`] - Pending queue flush
//! - [`orchestrator`] - Delta sync worker
//! - [`transport`] - Probing, selection, health monitoring
//! - [`discovery`] - mDNS peers
//! - [`peer`] - Direct peer link
//! - [`engine`] - Wiring and lifecycle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tandem_sync::{MemoryRecordStore, SyncConfig, SyncEngine};
//!
//! let config = SyncConfig::load_or_default(None);
//! let engine = SyncEngine::builder(config)
//!     .with_device(profile)
//!     .with_record_store(Arc::new(MemoryRecordStore::new()))
//!     .with_local_store(db.clone())
//!     .with_state_store(db)
//!     .build()?;
//!
//! let handle = engine.start().await?;
//! handle.orchestrator().queue_change(PendingChange::create(entity)).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod protocol;

pub mod local;
pub mod outbox;
pub mod remote;
pub mod resolver;

pub mod discovery;
pub mod peer;
pub mod transport;

pub mod engine;
pub mod orchestrator;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::SyncConfig;
pub use crypto::{AesGcmCipher, Cipher, PassthroughCipher};
pub use error::{SyncError, SyncResult};
pub use events::{FlushReport, SyncEvent, SyncReport, SyncState, SyncStatus};

pub use local::{LocalStore, MemoryLocalStore, MemoryStateStore, SyncStateStore};
pub use remote::{CloudRecordStore, FetchOutcome, MemoryRecordStore, RecordStore, RemoteStoreClient};
pub use resolver::ConflictResolver;

pub use discovery::{DiscoveredPeer, DiscoveryHandle, DiscoveryService, PeerDirectory, StaticPeers};
pub use peer::{PeerClient, PeerServer, PeerServerHandle};
pub use transport::{TransportSelector, TransportSelectorHandle};

pub use engine::{SyncEngine, SyncEngineBuilder, SyncEngineHandle};
pub use orchestrator::{SyncOrchestrator, SyncOrchestratorHandle, SyncTrigger};
