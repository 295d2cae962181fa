//! # Sync State Database
//!
//! Opens the SQLite file that holds tokens, the pending queue and the
//! device profile, and hands out repositories over one shared pool.
//!
//! ```text
//! DbConfig::new(path) ──► Database::new(config) ──► migrations ──► repositories
//!                              │
//!                              └── SqlitePool (WAL, NORMAL sync, foreign keys)
//!
//!   db.change_tokens()    per-zone delta cursors
//!   db.pending_changes()  outbox of local edits
//!   db.sync_marks()       settings high-water marks
//!   db.device_profiles()  this device's identity
//!   db.entities()         local entity copies (daemon mode)
//! ```
//!
//! The orchestrator writes a token after every page of results while the
//! application keeps reading its entities, so the file runs in WAL mode.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::{
    ChangeTokenRepository, DeviceProfileRepository, EntityRepository, PendingChangeRepository,
    SyncMarkRepository,
};

const IN_MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Where the sync state lives and how the pool is sized.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: PathBuf,

    /// Sync traffic is one writer (the orchestrator) plus a few readers.
    pub max_connections: u32,

    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,

    /// `None` keeps connections open for the life of the pool.
    pub idle_timeout: Option<Duration>,

    pub run_migrations: bool,
}

impl DbConfig {
    /// File-backed state. The file is created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: path.into(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(300)),
            run_migrations: true,
        }
    }

    /// Private in-memory state for tests.
    ///
    /// Every SQLite connection to `:memory:` opens its own empty database,
    /// so the pool is pinned to a single connection that never idles out.
    pub fn in_memory() -> Self {
        DbConfig {
            path: PathBuf::from(IN_MEMORY_PATH),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: None,
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_PATH
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the sync state database. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and, unless disabled, brings the schema up to date.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.path.display(), "Opening sync state database");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path.display()))
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(if config.is_in_memory() { 1 } else { 0 })
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        debug!(max_connections = config.max_connections, "Pool ready");

        let db = Database { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    /// ```rust,ignore
    /// let token = db.change_tokens().get(&zone).await?;
    /// ```
    pub fn change_tokens(&self) -> ChangeTokenRepository {
        ChangeTokenRepository::new(self.pool.clone())
    }

    pub fn pending_changes(&self) -> PendingChangeRepository {
        PendingChangeRepository::new(self.pool.clone())
    }

    pub fn sync_marks(&self) -> SyncMarkRepository {
        SyncMarkRepository::new(self.pool.clone())
    }

    pub fn device_profiles(&self) -> DeviceProfileRepository {
        DeviceProfileRepository::new(self.pool.clone())
    }

    pub fn entities(&self) -> EntityRepository {
        EntityRepository::new(self.pool.clone())
    }

    /// Waits for in-flight queries, then closes every connection. Later
    /// repository calls fail with `ConnectionFailed`.
    pub async fn close(&self) {
        info!("Closing sync state database");
        self.pool.close().await;
    }

    /// True if a trivial query succeeds.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
