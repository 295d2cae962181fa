//! # tandem-db
//!
//! Everything the sync engine must remember across restarts, in one SQLite
//! file accessed through sqlx.
//!
//! ```text
//!   SyncOrchestrator ──► Database (pool.rs) ──► tandem.db in the platform data dir
//!                           │
//!                           ├── change_tokens()    where each zone's delta left off
//!                           ├── pending_changes()  local edits not yet pushed
//!                           ├── sync_marks()       settings high-water marks
//!                           ├── device_profiles()  this device's identity
//!                           └── entities()         entity copies kept by the daemon
//!
//!   schema: migrations/001_sync_state.sql, embedded and applied on open
//! ```
//!
//! ```rust,ignore
//! let db = Database::new(DbConfig::new(data_dir.join("tandem.db"))).await?;
//! let token = db.change_tokens().get(&zone).await?;
//! let queued = db.pending_changes().list(100).await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::{
    ChangeTokenRepository, DeviceProfileRepository, EntityRepository, PendingChangeRepository,
    SyncMarkRepository,
};
