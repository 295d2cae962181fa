//! # Sync Events
//!
//! What the engine tells the rest of the application. Events go out on a
//! `tokio::sync::broadcast` channel; a slow subscriber loses old events
//! rather than stalling sync.
//!
//! ```text
//! orchestrator ──┬── EntityDeletedRemotely     local layer removes its copy
//!                ├── SettingsChangedRemotely   UI refreshes changed keys
//!                ├── SyncCompleted             status bar, last-sync time
//!                ├── SyncFailed                "sync paused"
//!                └── ConflictUnresolved        manual resolution
//! selector ──────── TransportChanged
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::transport::TransportChange;
use tandem_core::{DeviceClass, EntityRef, TransportKind, ZoneId};

/// Events buffered per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 256;

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one pass over the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Changes the store confirmed.
    pub pushed: usize,
    /// Changes left queued after a failed push.
    pub failed: usize,
    /// Changes removed after too many failed pushes.
    pub dropped: usize,
    /// Changes removed because merge-and-retry gave up.
    pub conflicts: usize,
    /// Peers that acked the direct batch.
    pub peers_reached: usize,
}

/// Outcome of one delta sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub zone: ZoneId,
    /// Remote entities written locally.
    pub applied: usize,
    /// Remote entities the local copy already matched.
    pub unchanged: usize,
    /// Remote deletions applied locally.
    pub deleted: usize,
    /// Merged results queued to go back to the store.
    pub requeued: usize,
    /// The store rejected the stored token; it was cleared.
    pub token_expired: bool,
    pub flush: FlushReport,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    /// The last sync failed. Data stays as last synced; the next trigger
    /// tries again.
    Paused,
    Stopped,
}

/// Current engine status for external queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub pending_count: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub active_transport: TransportKind,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            state: SyncState::Idle,
            pending_count: 0,
            last_sync: None,
            last_error: None,
            active_transport: TransportKind::CloudRelay,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    EntityDeletedRemotely {
        entity: EntityRef,
    },
    #[serde(rename_all = "camelCase")]
    SettingsChangedRemotely {
        settings_id: Uuid,
        device_class: Option<DeviceClass>,
        changed_fields: Vec<String>,
    },
    SyncCompleted {
        report: SyncReport,
    },
    SyncFailed {
        error: String,
        retryable: bool,
    },
    ConflictUnresolved {
        entity: EntityRef,
        attempts: u32,
    },
    TransportChanged {
        change: TransportChange,
    },
}

/// Creates the engine's event channel.
pub fn channel() -> broadcast::Sender<SyncEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}
