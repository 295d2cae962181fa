//! # Remote Record Store
//!
//! The remote store holds one account's records in named zones and hands
//! out change tokens over each zone's change log.
//!
//! ## Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   SyncOrchestrator / ConflictResolver                                  │
//! │        │  SyncEntity, EntityRef, FetchOutcome                          │
//! │        ▼                                                                │
//! │   RemoteStoreClient  (client.rs)                                       │
//! │        │  change-tag bookkeeping, page looping                         │
//! │        ▼                                                                │
//! │   RecordCodec        (codec.rs)   ◄── Cipher                           │
//! │        │  the only place entities become records and back              │
//! │        ▼                                                                │
//! │   dyn RecordStore                                                      │
//! │     ├── MemoryRecordStore  (memory.rs)  in-process, tests + memory://  │
//! │     └── CloudRecordStore   (cloud.rs)   JSON over WebSocket            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! "Already exists" and "token expired" are ordinary answers here, not
//! errors. Creation races between devices are expected.

pub mod client;
pub mod cloud;
pub mod codec;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::SyncResult;
use tandem_core::{ChangeToken, DeletedRecord, EntityRef, Record, RecordKey, SyncEntity, ZoneId};

pub use client::RemoteStoreClient;
pub use cloud::CloudRecordStore;
pub use codec::RecordCodec;
pub use memory::MemoryRecordStore;

// =============================================================================
// Store Answers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneCreation {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Created,
    AlreadyExists,
}

/// One page of a zone's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneChangesPage {
    #[serde(default)]
    pub changed: Vec<Record>,

    #[serde(default)]
    pub deleted: Vec<DeletedRecord>,

    /// Position after this page. Pass it back to continue.
    pub new_token: ChangeToken,

    pub more_coming: bool,
}

/// Result of a delta query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneFetch {
    Page(ZoneChangesPage),
    /// The token is no longer valid. The caller must start over without one.
    TokenExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveRecordResult {
    Saved(Record),
    /// The store holds a newer version than the one the save was based on.
    Conflict { server: Record },
}

/// Wakeup pushed by the store when a subscribed zone changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneNotification {
    pub zone: ZoneId,
}

// =============================================================================
// Record Store Trait
// =============================================================================

/// Record CRUD and delta queries over "record type + name + field map".
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_zone(&self, zone: &ZoneId) -> SyncResult<ZoneCreation>;

    /// Changes after `token`, or the whole zone when `token` is `None`.
    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: u32,
    ) -> SyncResult<ZoneFetch>;

    /// Saves a record. The record's change tag must match the stored one.
    async fn save_record(&self, record: Record) -> SyncResult<SaveRecordResult>;

    /// Deletes a record. Deleting a missing record succeeds.
    async fn delete_record(&self, key: &RecordKey) -> SyncResult<()>;

    async fn subscribe(
        &self,
        zone: &ZoneId,
        record_types: &[String],
    ) -> SyncResult<SubscriptionStatus>;

    /// Zone-changed wakeups for every subscription made through this store.
    fn notifications(&self) -> broadcast::Receiver<ZoneNotification>;
}

// =============================================================================
// Client-level Fetch Outcome
// =============================================================================

/// Decoded result of a full delta fetch (all pages).
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Changes {
        changed: Vec<SyncEntity>,
        deleted: Vec<EntityRef>,
        new_token: ChangeToken,
    },
    TokenExpired,
}

impl FetchOutcome {
    pub fn is_token_expired(&self) -> bool {
        matches!(self, FetchOutcome::TokenExpired)
    }
}
