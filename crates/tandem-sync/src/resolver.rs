//! # Conflict Resolver
//!
//! Pushes one entity, merging with the store's copy whenever the save is
//! rejected as stale.
//!
//! ```text
//! save(candidate) ── ok ──────────────────────────────► Ok(saved)
//!        │
//!    conflict(server)
//!        │
//!        ├── retries used up ─────────────────────────► ConflictUnresolved
//!        │
//!        ├── merge(candidate, server) == server ──────► Ok(server)
//!        │
//!        └── candidate = merged, try again
//! ```
//!
//! The first save is not a retry: with a cap of 3 the store sees at most
//! four saves for one entity.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStoreClient;
use tandem_core::merge::resolve_push_conflict;
use tandem_core::{EntityRef, MergeContext, SyncEntity};

pub struct ConflictResolver {
    client: Arc<RemoteStoreClient>,
    max_retries: u32,
}

impl ConflictResolver {
    pub fn new(client: Arc<RemoteStoreClient>, max_retries: u32) -> Self {
        ConflictResolver { client, max_retries }
    }

    /// Saves `entity`, resolving version conflicts by merge.
    ///
    /// Returns the version the store now holds.
    pub async fn save_with_merge(
        &self,
        entity: &SyncEntity,
        ctx: &MergeContext,
    ) -> SyncResult<SyncEntity> {
        let entity_ref = entity.entity_ref();
        let mut candidate = entity.clone();
        let mut retries = 0u32;

        loop {
            let server = match self.client.save(&candidate).await {
                Ok(saved) => {
                    if retries > 0 {
                        info!(
                            entity = %entity_ref,
                            retries,
                            "Saved after merging with server copy"
                        );
                    }
                    return Ok(saved);
                }
                Err(SyncError::VersionConflict { server }) => *server,
                Err(e) => return Err(e),
            };

            if retries >= self.max_retries {
                warn!(entity = %entity_ref, retries, "Giving up on conflicting save");
                return Err(SyncError::ConflictUnresolved {
                    entity: entity_ref,
                    attempts: retries,
                });
            }
            retries += 1;

            let merged = resolve_push_conflict(&candidate, &server, ctx)?;
            if merged == server {
                debug!(entity = %entity_ref, "Server copy already contains the local change");
                return Ok(server);
            }

            debug!(entity = %entity_ref, retry = retries, "Retrying save with merged version");
            candidate = merged;
        }
    }

    /// Deletes the entity's record. Deletion has no version check.
    pub async fn delete_entity(&self, entity: &EntityRef) -> SyncResult<()> {
        self.client.delete(entity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughCipher;
    use crate::remote::{
        MemoryRecordStore, RecordCodec, RecordStore, SaveRecordResult, SubscriptionStatus,
        ZoneCreation, ZoneFetch, ZoneNotification,
    };
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use tandem_core::{
        ChangeToken, Conversation, Message, MessageRole, Project, Record, RecordKey, ZoneId,
    };
    use tokio::sync::broadcast;

    fn resolver_for(store: Arc<dyn RecordStore>, max_retries: u32) -> ConflictResolver {
        let client = RemoteStoreClient::new(store, Arc::new(PassthroughCipher), 50);
        ConflictResolver::new(Arc::new(client), max_retries)
    }

    #[tokio::test]
    async fn test_conversation_conflict_merges_messages() {
        let store = Arc::new(MemoryRecordStore::new());
        let zone = ZoneId::default();
        let laptop = resolver_for(store.clone(), 3);
        let phone = resolver_for(store.clone(), 3);
        store.create_zone(&zone).await.unwrap();

        let now = Utc::now();
        let base = Conversation::new(zone.clone(), "Plans", now);

        let mut on_laptop = base.clone();
        on_laptop.append_message(Message::new(&base, MessageRole::User, "from laptop", now));
        laptop
            .save_with_merge(&on_laptop.into(), &MergeContext::default())
            .await
            .unwrap();

        let mut on_phone = base.clone();
        on_phone.append_message(Message::new(
            &base,
            MessageRole::User,
            "from phone",
            now + Duration::seconds(1),
        ));
        let saved = phone
            .save_with_merge(&on_phone.into(), &MergeContext::default())
            .await
            .unwrap();

        match saved {
            SyncEntity::Conversation(c) => {
                let texts: Vec<_> = c.messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(texts, vec!["from laptop", "from phone"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_project_settles_on_server_copy() {
        let store = Arc::new(MemoryRecordStore::new());
        let zone = ZoneId::default();
        let laptop = resolver_for(store.clone(), 3);
        let phone = resolver_for(store.clone(), 3);
        store.create_zone(&zone).await.unwrap();

        let now = Utc::now();
        let mut newer = Project::new(zone.clone(), "Newer", now);
        newer.last_modified = now + Duration::seconds(30);
        laptop
            .save_with_merge(&newer.clone().into(), &MergeContext::default())
            .await
            .unwrap();

        let mut older = newer.clone();
        older.name = "Older".into();
        older.last_modified = now;
        let saved = phone
            .save_with_merge(&older.into(), &MergeContext::default())
            .await
            .unwrap();

        assert_eq!(saved, SyncEntity::Project(newer));
    }

    /// Store that rejects every save, answering with a rival edit of
    /// whatever it was sent.
    struct Rival {
        inner: MemoryRecordStore,
        codec: RecordCodec,
        saves: parking_lot::Mutex<u32>,
        edit: fn(SyncEntity) -> SyncEntity,
    }

    impl Rival {
        fn new(edit: fn(SyncEntity) -> SyncEntity) -> Arc<Self> {
            Arc::new(Rival {
                inner: MemoryRecordStore::new(),
                codec: RecordCodec::new(Arc::new(PassthroughCipher)),
                saves: parking_lot::Mutex::new(0),
                edit,
            })
        }

        fn saves(&self) -> u32 {
            *self.saves.lock()
        }
    }

    #[async_trait]
    impl RecordStore for Rival {
        async fn create_zone(&self, zone: &ZoneId) -> SyncResult<ZoneCreation> {
            self.inner.create_zone(zone).await
        }

        async fn fetch_zone_changes(
            &self,
            zone: &ZoneId,
            token: Option<&ChangeToken>,
            limit: u32,
        ) -> SyncResult<ZoneFetch> {
            self.inner.fetch_zone_changes(zone, token, limit).await
        }

        async fn save_record(&self, record: Record) -> SyncResult<SaveRecordResult> {
            *self.saves.lock() += 1;
            let rival = (self.edit)(self.codec.decode(&record)?);
            let mut server = self.codec.encode(&rival, None)?;
            server.change_tag = Some(uuid::Uuid::new_v4().to_string());
            Ok(SaveRecordResult::Conflict { server })
        }

        async fn delete_record(&self, key: &RecordKey) -> SyncResult<()> {
            self.inner.delete_record(key).await
        }

        async fn subscribe(
            &self,
            zone: &ZoneId,
            record_types: &[String],
        ) -> SyncResult<SubscriptionStatus> {
            self.inner.subscribe(zone, record_types).await
        }

        fn notifications(&self) -> broadcast::Receiver<ZoneNotification> {
            self.inner.notifications()
        }
    }

    #[tokio::test]
    async fn test_newer_server_copy_ends_retries() {
        let store = Rival::new(|entity| match entity {
            SyncEntity::Project(mut p) => {
                p.name = "server edit".into();
                p.last_modified += Duration::seconds(10);
                p.into()
            }
            other => other,
        });
        let resolver = resolver_for(store.clone(), 3);
        let project = Project::new(ZoneId::default(), "Mine", Utc::now());

        let saved = resolver
            .save_with_merge(&project.into(), &MergeContext::default())
            .await
            .unwrap();

        assert!(matches!(saved, SyncEntity::Project(ref p) if p.name == "server edit"));
        assert_eq!(store.saves(), 1);
    }

    #[tokio::test]
    async fn test_retry_cap_surfaces_unresolved_conflict() {
        // The rival keeps only a fresh message of its own, so every merge
        // has something to add and never settles on the server copy.
        let store = Rival::new(|entity| match entity {
            SyncEntity::Conversation(mut c) => {
                c.messages.clear();
                let rival = Message::new(&c, MessageRole::Assistant, "rival", Utc::now());
                c.append_message(rival);
                c.into()
            }
            other => other,
        });
        let resolver = resolver_for(store.clone(), 3);

        let now = Utc::now();
        let mut conversation = Conversation::new(ZoneId::default(), "Chat", now);
        let message = Message::new(&conversation, MessageRole::User, "hi", now);
        conversation.append_message(message);

        match resolver
            .save_with_merge(&conversation.into(), &MergeContext::default())
            .await
        {
            Err(SyncError::ConflictUnresolved { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected unresolved conflict, got {:?}", other),
        }
        assert_eq!(store.saves(), 4);
    }
}
