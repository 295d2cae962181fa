//! # Remote Store Client
//!
//! Typed access to the record store: entities in, entities out.
//!
//! ## Optimistic Concurrency
//! ```text
//! fetch ──► remember change tag per record
//!
//! save(entity) ──► record + remembered tag ──► store
//!                                              │
//!                      ┌───────────────────────┴──────────────────┐
//!                      ▼                                          ▼
//!                   Saved(record)                          Conflict { server }
//!                   remember new tag                       remember server tag
//!                   Ok(entity)                             Err(VersionConflict { server entity })
//! ```
//!
//! The tag collector is a plain mutex touched only between awaits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    FetchOutcome, RecordCodec, RecordStore, SaveRecordResult, SubscriptionStatus, ZoneCreation,
    ZoneFetch, ZoneNotification,
};
use crate::crypto::Cipher;
use crate::error::{SyncError, SyncResult};
use tandem_core::{ChangeToken, EntityKind, EntityRef, Record, RecordKey, SyncEntity, ZoneId};

/// Client for one remote record store.
pub struct RemoteStoreClient {
    store: Arc<dyn RecordStore>,
    codec: RecordCodec,
    page_size: u32,
    change_tags: Mutex<HashMap<RecordKey, String>>,
}

impl RemoteStoreClient {
    pub fn new(store: Arc<dyn RecordStore>, cipher: Arc<dyn Cipher>, page_size: u32) -> Self {
        RemoteStoreClient {
            store,
            codec: RecordCodec::new(cipher),
            page_size: page_size.max(1),
            change_tags: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the zone. An existing zone counts as success.
    pub async fn create_zone_if_absent(&self, zone: &ZoneId) -> SyncResult<()> {
        match self.store.create_zone(zone).await? {
            ZoneCreation::Created => info!(zone = %zone, "Created zone"),
            ZoneCreation::AlreadyExists => debug!(zone = %zone, "Zone already exists"),
        }
        Ok(())
    }

    /// Fetches every change after `since`, following pages until the store
    /// reports no more.
    ///
    /// Undecodable records are skipped. An expired token on any page yields
    /// [`FetchOutcome::TokenExpired`].
    pub async fn fetch_changes(
        &self,
        zone: &ZoneId,
        since: Option<&ChangeToken>,
    ) -> SyncResult<FetchOutcome> {
        let mut token = since.cloned();
        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        let mut pages = 0u32;

        loop {
            let page = match self
                .store
                .fetch_zone_changes(zone, token.as_ref(), self.page_size)
                .await?
            {
                ZoneFetch::Page(page) => page,
                ZoneFetch::TokenExpired => {
                    warn!(zone = %zone, "Change token expired");
                    return Ok(FetchOutcome::TokenExpired);
                }
            };
            pages += 1;

            for (entity, record) in self.codec.decode_lossy(page.changed.iter()) {
                self.remember_tag(record);
                changed.push(entity);
            }

            for key in &page.deleted {
                self.forget_tag(key);
                match key.entity_ref() {
                    Ok(entity_ref) => deleted.push(entity_ref),
                    Err(e) => warn!(
                        record_type = %key.record_type,
                        error = %e,
                        "Skipping unknown deletion"
                    ),
                }
            }

            token = Some(page.new_token);
            if !page.more_coming {
                break;
            }
        }

        debug!(
            zone = %zone,
            pages,
            changed = changed.len(),
            deleted = deleted.len(),
            "Fetched zone changes"
        );

        match token {
            Some(new_token) => Ok(FetchOutcome::Changes {
                changed,
                deleted,
                new_token,
            }),
            None => Err(SyncError::Internal("fetch ended without a token".into())),
        }
    }

    /// Saves an entity against the last version this device saw.
    ///
    /// A stale version fails with [`SyncError::VersionConflict`] carrying the
    /// store's current entity.
    pub async fn save(&self, entity: &SyncEntity) -> SyncResult<SyncEntity> {
        let key = RecordKey::from(&entity.entity_ref());
        let tag = self.change_tags.lock().get(&key).cloned();
        let record = self.codec.encode(entity, tag)?;

        match self.store.save_record(record).await? {
            SaveRecordResult::Saved(saved) => {
                self.remember_tag(&saved);
                debug!(entity = %entity.entity_ref(), tag = ?saved.change_tag, "Saved record");
                Ok(entity.clone())
            }
            SaveRecordResult::Conflict { server } => {
                self.remember_tag(&server);
                let server_entity = self.codec.decode(&server)?;
                debug!(entity = %entity.entity_ref(), "Save rejected: version conflict");
                Err(SyncError::VersionConflict {
                    server: Box::new(server_entity),
                })
            }
        }
    }

    /// Deletes the record behind an entity reference.
    pub async fn delete(&self, entity: &EntityRef) -> SyncResult<()> {
        let key = RecordKey::from(entity);
        self.store.delete_record(&key).await?;
        self.forget_tag(&key);
        debug!(entity = %entity, "Deleted record");
        Ok(())
    }

    /// Subscribes to changes of every entity kind in the zone. An existing
    /// subscription counts as success.
    pub async fn subscribe(&self, zone: &ZoneId) -> SyncResult<()> {
        let kinds: Vec<String> = EntityKind::ALL
            .iter()
            .map(|kind| kind.record_type().to_string())
            .collect();

        match self.store.subscribe(zone, &kinds).await? {
            SubscriptionStatus::Created => info!(zone = %zone, "Subscribed to zone changes"),
            SubscriptionStatus::AlreadyExists => {
                debug!(zone = %zone, "Subscription already exists")
            }
        }
        Ok(())
    }

    pub fn notifications(&self) -> broadcast::Receiver<ZoneNotification> {
        self.store.notifications()
    }

    fn remember_tag(&self, record: &Record) {
        if let Some(tag) = &record.change_tag {
            self.change_tags.lock().insert(record.key(), tag.clone());
        }
    }

    fn forget_tag(&self, key: &RecordKey) {
        self.change_tags.lock().remove(key);
    }
}
