//! # Repository Module
//!
//! Database repository implementations for sync state.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  SyncOrchestrator                                                      │
//! │       │                                                                 │
//! │       │  db.change_tokens().get(&zone)                                 │
//! │       ▼                                                                 │
//! │  ChangeTokenRepository                                                 │
//! │  ├── get(&self, zone)                                                  │
//! │  ├── put(&self, zone, token)                                           │
//! │  └── clear(&self, zone)                                                │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`ChangeTokenRepository`] - Per-zone change tokens
//! - [`PendingChangeRepository`] - Outbox of local mutations
//! - [`SyncMarkRepository`] - Named high-water timestamps
//! - [`DeviceProfileRepository`] - This device's identity
//! - [`EntityRepository`] - Local entity copies

pub mod device;
pub mod entity;
pub mod marks;
pub mod pending;
pub mod tokens;

pub use device::DeviceProfileRepository;
pub use entity::EntityRepository;
pub use marks::SyncMarkRepository;
pub use pending::PendingChangeRepository;
pub use tokens::ChangeTokenRepository;
