//! # tandemd
//!
//! Headless sync daemon. Loads `sync.toml` plus `TANDEM_*` overrides, opens
//! the local database and keeps it in sync until Ctrl-C.
//!
//! ## Log Levels
//! - `RUST_LOG=debug` - Show debug messages
//! - `RUST_LOG=tandem_sync=trace` - Trace the sync engine only
//! - Default: INFO level

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use tandem_db::{Database, DbConfig};
use tandem_sync::{
    CloudRecordStore, MemoryRecordStore, RecordStore, SyncConfig, SyncEngine, SyncError,
    SyncEvent, SyncResult,
};

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        error!(error = %e, "tandemd exited with an error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tandem_sync=debug,sqlx=warn,mdns_sd=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

async fn run() -> SyncResult<()> {
    let config_path = std::env::var("TANDEM_CONFIG").ok().map(PathBuf::from);
    let config = SyncConfig::load_or_default(config_path);

    if !config.is_sync_enabled() {
        info!("Sync disabled in configuration, nothing to do");
        return Ok(());
    }

    let db_path = config
        .database_path()
        .ok_or_else(|| SyncError::InvalidConfig("no database path available".into()))?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Database::new(DbConfig::new(db_path.clone())).await?);
    info!(path = ?db_path, "Local database ready");

    let mut device = db
        .device_profiles()
        .load_or_create(&config.device.name, config.device.class)
        .await?;
    if let Some(id) = config.device.id.clone() {
        device.device_id = id;
    }

    let store = open_record_store(&config)?;

    let engine = SyncEngine::builder(config)
        .with_device(device)
        .with_record_store(store)
        .with_local_store(db.clone())
        .with_state_store(db.clone())
        .build()?;

    let handle = engine.start().await?;
    let mut events = handle.events();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "Event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    handle.stop().await?;
    db.close().await;
    Ok(())
}

/// Picks the record store by URL scheme.
fn open_record_store(config: &SyncConfig) -> SyncResult<Arc<dyn RecordStore>> {
    if config.remote.is_memory() {
        info!("Using in-process record store; data stays on this device");
        return Ok(Arc::new(MemoryRecordStore::new()));
    }
    Ok(Arc::new(CloudRecordStore::connect(&config.remote)?))
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::SyncCompleted { report } => info!(
            applied = report.applied,
            deleted = report.deleted,
            pushed = report.flush.pushed,
            token_expired = report.token_expired,
            "Sync completed"
        ),
        SyncEvent::SyncFailed { error, retryable } => {
            info!(%error, retryable, "Sync paused")
        }
        SyncEvent::ConflictUnresolved { entity, attempts } => {
            info!(entity = %entity, attempts, "Conflict needs manual resolution")
        }
        SyncEvent::TransportChanged { change } => info!(
            from = ?change.from,
            to = ?change.to,
            reason = ?change.reason,
            "Transport changed"
        ),
        SyncEvent::EntityDeletedRemotely { entity } => {
            info!(entity = %entity, "Entity deleted on another device")
        }
        SyncEvent::SettingsChangedRemotely { changed_fields, .. } => {
            info!(fields = ?changed_fields, "Settings changed on another device")
        }
    }
}
