//! # Local Collaborators
//!
//! What the orchestrator needs from the device it runs on: somewhere to
//! apply merged entities, and somewhere to keep its own bookkeeping.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  LocalStore        the application's copy of every entity               │
//! │                    load / apply / remove                                │
//! │                                                                         │
//! │  SyncStateStore    owned by the orchestrator                            │
//! │                    change token per zone                                │
//! │                    pending change queue (FIFO)                          │
//! │                    settings mark per zone                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Database`] implements both for the daemon. The `Memory*` versions back
//! tests and embedders that persist elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::SyncResult;
use tandem_core::{ChangeToken, EntityKind, EntityRef, PendingChange, SyncEntity, ZoneId};
use tandem_db::Database;

// =============================================================================
// Traits
// =============================================================================

/// The application's local entity storage.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn load(&self, entity: &EntityRef) -> SyncResult<Option<SyncEntity>>;

    /// Inserts or replaces an entity.
    async fn apply(&self, entity: SyncEntity) -> SyncResult<()>;

    /// Removes an entity. Returns false if it was not present.
    async fn remove(&self, entity: &EntityRef) -> SyncResult<bool>;
}

/// Durable orchestrator state.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn token(&self, zone: &ZoneId) -> SyncResult<Option<ChangeToken>>;

    async fn put_token(&self, zone: &ZoneId, token: &ChangeToken) -> SyncResult<()>;

    async fn clear_token(&self, zone: &ZoneId) -> SyncResult<()>;

    async fn enqueue(&self, change: &PendingChange) -> SyncResult<()>;

    /// Up to `limit` queued changes, oldest first.
    async fn pending(&self, limit: u32) -> SyncResult<Vec<PendingChange>>;

    async fn remove_pending(&self, id: Uuid) -> SyncResult<()>;

    /// Bumps the attempt count and returns the new value.
    async fn record_failure(&self, id: Uuid, error: &str) -> SyncResult<u32>;

    async fn pending_count(&self) -> SyncResult<u64>;

    /// When remote settings were last applied in `zone`.
    async fn settings_mark(&self, zone: &ZoneId) -> SyncResult<Option<DateTime<Utc>>>;

    /// Moves the settings mark forward. Never moves it back.
    async fn advance_settings_mark(&self, zone: &ZoneId, at: DateTime<Utc>) -> SyncResult<()>;
}

fn settings_scope(zone: &ZoneId) -> String {
    format!("settings:{}", zone)
}

// =============================================================================
// Database
// =============================================================================

#[async_trait]
impl LocalStore for Database {
    async fn load(&self, entity: &EntityRef) -> SyncResult<Option<SyncEntity>> {
        Ok(self.entities().get(entity.kind, entity.id).await?)
    }

    async fn apply(&self, entity: SyncEntity) -> SyncResult<()> {
        Ok(self.entities().upsert(&entity).await?)
    }

    async fn remove(&self, entity: &EntityRef) -> SyncResult<bool> {
        Ok(self.entities().delete(entity.kind, entity.id).await?)
    }
}

#[async_trait]
impl SyncStateStore for Database {
    async fn token(&self, zone: &ZoneId) -> SyncResult<Option<ChangeToken>> {
        Ok(self.change_tokens().get(zone).await?)
    }

    async fn put_token(&self, zone: &ZoneId, token: &ChangeToken) -> SyncResult<()> {
        Ok(self.change_tokens().put(zone, token).await?)
    }

    async fn clear_token(&self, zone: &ZoneId) -> SyncResult<()> {
        Ok(self.change_tokens().clear(zone).await?)
    }

    async fn enqueue(&self, change: &PendingChange) -> SyncResult<()> {
        Ok(self.pending_changes().enqueue(change).await?)
    }

    async fn pending(&self, limit: u32) -> SyncResult<Vec<PendingChange>> {
        Ok(self.pending_changes().list(limit).await?)
    }

    async fn remove_pending(&self, id: Uuid) -> SyncResult<()> {
        self.pending_changes().remove(id).await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> SyncResult<u32> {
        Ok(self.pending_changes().record_failure(id, error).await?)
    }

    async fn pending_count(&self) -> SyncResult<u64> {
        Ok(self.pending_changes().count().await?)
    }

    async fn settings_mark(&self, zone: &ZoneId) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.sync_marks().get(&settings_scope(zone)).await?)
    }

    async fn advance_settings_mark(&self, zone: &ZoneId, at: DateTime<Utc>) -> SyncResult<()> {
        Ok(self.sync_marks().advance(&settings_scope(zone), at).await?)
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Entity map keyed by kind and id.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: Mutex<HashMap<(EntityKind, Uuid), SyncEntity>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: &EntityRef) -> Option<SyncEntity> {
        self.entities.lock().get(&(entity.kind, entity.id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.lock().is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn load(&self, entity: &EntityRef) -> SyncResult<Option<SyncEntity>> {
        Ok(self.get(entity))
    }

    async fn apply(&self, entity: SyncEntity) -> SyncResult<()> {
        self.entities.lock().insert((entity.kind(), entity.id()), entity);
        Ok(())
    }

    async fn remove(&self, entity: &EntityRef) -> SyncResult<bool> {
        Ok(self.entities.lock().remove(&(entity.kind, entity.id)).is_some())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tokens: HashMap<ZoneId, ChangeToken>,
    queue: Vec<PendingChange>,
    marks: HashMap<ZoneId, DateTime<Utc>>,
}

/// Orchestrator state that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for MemoryStateStore {
    async fn token(&self, zone: &ZoneId) -> SyncResult<Option<ChangeToken>> {
        Ok(self.inner.lock().tokens.get(zone).cloned())
    }

    async fn put_token(&self, zone: &ZoneId, token: &ChangeToken) -> SyncResult<()> {
        self.inner.lock().tokens.insert(zone.clone(), token.clone());
        Ok(())
    }

    async fn clear_token(&self, zone: &ZoneId) -> SyncResult<()> {
        self.inner.lock().tokens.remove(zone);
        Ok(())
    }

    async fn enqueue(&self, change: &PendingChange) -> SyncResult<()> {
        self.inner.lock().queue.push(change.clone());
        Ok(())
    }

    async fn pending(&self, limit: u32) -> SyncResult<Vec<PendingChange>> {
        let state = self.inner.lock();
        Ok(state.queue.iter().take(limit as usize).cloned().collect())
    }

    async fn remove_pending(&self, id: Uuid) -> SyncResult<()> {
        self.inner.lock().queue.retain(|change| change.id != id);
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> SyncResult<u32> {
        let mut state = self.inner.lock();
        match state.queue.iter_mut().find(|change| change.id == id) {
            Some(change) => {
                change.attempts += 1;
                change.last_error = Some(error.to_string());
                Ok(change.attempts)
            }
            None => Ok(0),
        }
    }

    async fn pending_count(&self) -> SyncResult<u64> {
        Ok(self.inner.lock().queue.len() as u64)
    }

    async fn settings_mark(&self, zone: &ZoneId) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().marks.get(zone).copied())
    }

    async fn advance_settings_mark(&self, zone: &ZoneId, at: DateTime<Utc>) -> SyncResult<()> {
        let mut state = self.inner.lock();
        let mark = state.marks.entry(zone.clone()).or_insert(at);
        if at > *mark {
            *mark = at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tandem_core::Project;
    use tandem_db::DbConfig;

    fn project(name: &str) -> SyncEntity {
        Project::new(ZoneId::default(), name, Utc::now()).into()
    }

    /// Runs the same checks against every state store.
    async fn exercise_state_store(store: &dyn SyncStateStore) {
        let zone = ZoneId::default();

        assert_eq!(store.token(&zone).await.unwrap(), None);
        store.put_token(&zone, &ChangeToken::new(vec![1, 2, 3])).await.unwrap();
        assert_eq!(store.token(&zone).await.unwrap(), Some(ChangeToken::new(vec![1, 2, 3])));
        store.clear_token(&zone).await.unwrap();
        assert_eq!(store.token(&zone).await.unwrap(), None);

        let first = PendingChange::create(project("first"));
        let second = PendingChange::update(project("second"));
        store.enqueue(&first).await.unwrap();
        store.enqueue(&second).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 2);

        let ids: Vec<Uuid> = store.pending(10).await.unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(store.pending(1).await.unwrap().len(), 1);

        assert_eq!(store.record_failure(first.id, "offline").await.unwrap(), 1);
        assert_eq!(store.record_failure(first.id, "offline").await.unwrap(), 2);
        let head = &store.pending(1).await.unwrap()[0];
        assert_eq!(head.attempts, 2);
        assert_eq!(head.last_error.as_deref(), Some("offline"));

        store.remove_pending(first.id).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let now = Utc::now();
        store.advance_settings_mark(&zone, now).await.unwrap();
        store.advance_settings_mark(&zone, now - Duration::hours(1)).await.unwrap();
        let mark = store.settings_mark(&zone).await.unwrap().unwrap();
        assert_eq!(mark.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_memory_state_store() {
        exercise_state_store(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_database_state_store() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        exercise_state_store(&db).await;
    }

    #[tokio::test]
    async fn test_local_store_apply_and_remove() {
        let memory = MemoryLocalStore::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let stores: [&dyn LocalStore; 2] = [&memory, &db];

        for store in stores {
            let entity = project("Atlas");
            let entity_ref = entity.entity_ref();

            assert_eq!(store.load(&entity_ref).await.unwrap(), None);
            store.apply(entity.clone()).await.unwrap();
            assert_eq!(store.load(&entity_ref).await.unwrap(), Some(entity));
            assert!(store.remove(&entity_ref).await.unwrap());
            assert!(!store.remove(&entity_ref).await.unwrap());
        }
    }
}
