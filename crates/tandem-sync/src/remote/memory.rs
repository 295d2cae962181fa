//! # In-Memory Record Store
//!
//! A complete record store living in the process. Devices that share one
//! `MemoryRecordStore` (through `Arc`) see each other's writes exactly as
//! they would through a hosted store.
//!
//! ## Change Log
//! ```text
//! zone "TandemZone"   epoch 1
//!
//!   seq   1        2        3         4         5
//!         save A   save B   save A    delete B  save C
//!
//!   current:  A@3  C@5          tombstones: B@4
//!
//!   token = epoch ++ seq (16 bytes)
//!   fetch(token@2) → changed [A, C], deleted [B], token@5
//! ```
//!
//! Only the latest touch of each record is kept, so a page never carries
//! the same record twice. `expire_tokens` starts a new epoch; every token
//! issued before it is answered with `TokenExpired`.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    RecordStore, SaveRecordResult, SubscriptionStatus, ZoneChangesPage, ZoneCreation, ZoneFetch,
    ZoneNotification,
};
use crate::error::{SyncError, SyncResult};
use tandem_core::{ChangeToken, Record, RecordKey, ZoneId};

const TOKEN_LEN: usize = 16;

#[derive(Debug)]
struct StoredRecord {
    record: Record,
    seq: u64,
}

#[derive(Debug)]
struct ZoneLog {
    epoch: u64,
    last_seq: u64,
    records: HashMap<(String, String), StoredRecord>,
    tombstones: HashMap<(String, String), u64>,
    subscribed_types: BTreeSet<String>,
    subscribed: bool,
}

impl ZoneLog {
    fn new(epoch: u64) -> Self {
        ZoneLog {
            epoch,
            last_seq: 0,
            records: HashMap::new(),
            tombstones: HashMap::new(),
            subscribed_types: BTreeSet::new(),
            subscribed: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    fn token(&self, seq: u64) -> ChangeToken {
        let mut bytes = Vec::with_capacity(TOKEN_LEN);
        bytes.extend_from_slice(&self.epoch.to_be_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        ChangeToken::new(bytes)
    }

    /// Position encoded in a token, or `None` if the token is not valid for
    /// this epoch.
    fn position(&self, token: &ChangeToken) -> Option<u64> {
        let bytes = token.as_bytes();
        if bytes.len() != TOKEN_LEN {
            return None;
        }
        let (epoch, seq) = bytes.split_at(8);
        let epoch = u64::from_be_bytes(epoch.try_into().ok()?);
        let seq = u64::from_be_bytes(seq.try_into().ok()?);
        (epoch == self.epoch && seq <= self.last_seq).then_some(seq)
    }

    fn notifies(&self, record_type: &str) -> bool {
        self.subscribed
            && (self.subscribed_types.is_empty() || self.subscribed_types.contains(record_type))
    }
}

#[derive(Debug, Default)]
struct StoreState {
    zones: HashMap<ZoneId, ZoneLog>,
    next_tag: u64,
    next_epoch: u64,
    offline: bool,
    fetch_log: Vec<Option<ChangeToken>>,
}

impl StoreState {
    fn check_online(&self) -> SyncResult<()> {
        if self.offline {
            return Err(SyncError::ConnectionFailed("record store unreachable".into()));
        }
        Ok(())
    }

    fn zone_mut(&mut self, zone: &ZoneId) -> SyncResult<&mut ZoneLog> {
        self.zones
            .get_mut(zone)
            .ok_or_else(|| SyncError::ZoneNotFound(zone.to_string()))
    }

    fn new_tag(&mut self) -> String {
        self.next_tag += 1;
        format!("ct-{}", self.next_tag)
    }
}

/// In-process record store.
pub struct MemoryRecordStore {
    state: Mutex<StoreState>,
    notify_tx: broadcast::Sender<ZoneNotification>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        MemoryRecordStore {
            state: Mutex::new(StoreState {
                next_epoch: 1,
                ..Default::default()
            }),
            notify_tx,
        }
    }

    // =========================================================================
    // Inspection and fault injection
    // =========================================================================

    /// Invalidates every token issued for the zone and drops its tombstones,
    /// the way a store compacts its change history.
    pub fn expire_tokens(&self, zone: &ZoneId) {
        let mut state = self.state.lock();
        let epoch = state.next_epoch;
        if let Some(log) = state.zones.get_mut(zone) {
            log.epoch = epoch;
            log.tombstones.clear();
            state.next_epoch += 1;
            debug!(zone = %zone, epoch, "Expired change tokens");
        }
    }

    /// While offline every operation fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Tokens passed to `fetch_zone_changes`, oldest first.
    pub fn fetch_log(&self) -> Vec<Option<ChangeToken>> {
        self.state.lock().fetch_log.clone()
    }

    /// Current record, if any.
    pub fn record(&self, key: &RecordKey) -> Option<Record> {
        let state = self.state.lock();
        state
            .zones
            .get(&key.zone)?
            .records
            .get(&(key.record_type.clone(), key.record_name.clone()))
            .map(|stored| stored.record.clone())
    }

    pub fn record_count(&self, zone: &ZoneId) -> usize {
        self.state
            .lock()
            .zones
            .get(zone)
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    fn notify(&self, zone: &ZoneId) {
        // No receivers is fine.
        let _ = self.notify_tx.send(ZoneNotification { zone: zone.clone() });
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_zone(&self, zone: &ZoneId) -> SyncResult<ZoneCreation> {
        let mut state = self.state.lock();
        state.check_online()?;

        if state.zones.contains_key(zone) {
            return Ok(ZoneCreation::AlreadyExists);
        }

        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.zones.insert(zone.clone(), ZoneLog::new(epoch));
        Ok(ZoneCreation::Created)
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: u32,
    ) -> SyncResult<ZoneFetch> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.fetch_log.push(token.cloned());

        let log = state.zone_mut(zone)?;
        let since = match token {
            None => 0,
            Some(token) => match log.position(token) {
                Some(seq) => seq,
                None => return Ok(ZoneFetch::TokenExpired),
            },
        };

        enum Entry<'a> {
            Changed(&'a Record),
            Deleted(&'a (String, String)),
        }

        let mut entries: Vec<(u64, Entry<'_>)> = log
            .records
            .values()
            .filter(|stored| stored.seq > since)
            .map(|stored| (stored.seq, Entry::Changed(&stored.record)))
            .chain(
                log.tombstones
                    .iter()
                    .filter(|(_, seq)| **seq > since)
                    .map(|(key, seq)| (*seq, Entry::Deleted(key))),
            )
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);

        let limit = limit.max(1) as usize;
        let more_coming = entries.len() > limit;
        entries.truncate(limit);

        let position = if more_coming {
            entries.last().map(|(seq, _)| *seq).unwrap_or(since)
        } else {
            log.last_seq
        };

        let mut page = ZoneChangesPage {
            changed: Vec::new(),
            deleted: Vec::new(),
            new_token: log.token(position),
            more_coming,
        };
        for (_, entry) in entries {
            match entry {
                Entry::Changed(record) => page.changed.push(record.clone()),
                Entry::Deleted((record_type, record_name)) => page.deleted.push(RecordKey {
                    zone: zone.clone(),
                    record_type: record_type.clone(),
                    record_name: record_name.clone(),
                }),
            }
        }

        Ok(ZoneFetch::Page(page))
    }

    async fn save_record(&self, mut record: Record) -> SyncResult<SaveRecordResult> {
        let (saved, notify) = {
            let mut state = self.state.lock();
            state.check_online()?;
            let tag = state.new_tag();

            let log = state.zone_mut(&record.zone)?;
            let key = (record.record_type.clone(), record.record_name.clone());

            if let Some(current) = log.records.get(&key) {
                if current.record.change_tag != record.change_tag {
                    return Ok(SaveRecordResult::Conflict {
                        server: current.record.clone(),
                    });
                }
            }

            let seq = log.next_seq();
            let notify = log.notifies(&record.record_type);
            record.change_tag = Some(tag);
            log.tombstones.remove(&key);
            log.records.insert(
                key,
                StoredRecord {
                    record: record.clone(),
                    seq,
                },
            );
            (record, notify)
        };

        if notify {
            self.notify(&saved.zone);
        }
        Ok(SaveRecordResult::Saved(saved))
    }

    async fn delete_record(&self, key: &RecordKey) -> SyncResult<()> {
        let notify = {
            let mut state = self.state.lock();
            state.check_online()?;

            let log = state.zone_mut(&key.zone)?;
            let map_key = (key.record_type.clone(), key.record_name.clone());
            if log.records.remove(&map_key).is_none() {
                return Ok(());
            }
            let seq = log.next_seq();
            log.tombstones.insert(map_key, seq);
            log.notifies(&key.record_type)
        };

        if notify {
            self.notify(&key.zone);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        zone: &ZoneId,
        record_types: &[String],
    ) -> SyncResult<SubscriptionStatus> {
        let mut state = self.state.lock();
        state.check_online()?;

        let log = state.zone_mut(zone)?;
        let existed = log.subscribed;
        log.subscribed = true;
        log.subscribed_types.extend(record_types.iter().cloned());

        Ok(if existed {
            SubscriptionStatus::AlreadyExists
        } else {
            SubscriptionStatus::Created
        })
    }

    fn notifications(&self) -> broadcast::Receiver<ZoneNotification> {
        self.notify_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::FieldValue;

    fn record(name: &str) -> Record {
        Record::new("Project", name, ZoneId::default())
            .with_field("title", FieldValue::Text(name.into()))
    }

    async fn store() -> MemoryRecordStore {
        let store = MemoryRecordStore::new();
        store.create_zone(&ZoneId::default()).await.unwrap();
        store
    }

    fn page(fetch: ZoneFetch) -> ZoneChangesPage {
        match fetch {
            ZoneFetch::Page(page) => page,
            ZoneFetch::TokenExpired => panic!("unexpected token expiry"),
        }
    }

    #[tokio::test]
    async fn test_zone_creation_is_idempotent() {
        let store = MemoryRecordStore::new();
        let zone = ZoneId::default();
        assert_eq!(store.create_zone(&zone).await.unwrap(), ZoneCreation::Created);
        assert_eq!(store.create_zone(&zone).await.unwrap(), ZoneCreation::AlreadyExists);
    }

    #[tokio::test]
    async fn test_delta_fetch_from_token() {
        let store = store().await;
        let zone = ZoneId::default();

        store.save_record(record("a")).await.unwrap();
        let first = page(store.fetch_zone_changes(&zone, None, 100).await.unwrap());
        assert_eq!(first.changed.len(), 1);
        assert!(!first.more_coming);

        store.save_record(record("b")).await.unwrap();
        store.save_record(record("c")).await.unwrap();
        store
            .delete_record(&RecordKey {
                zone: zone.clone(),
                record_type: "Project".into(),
                record_name: "b".into(),
            })
            .await
            .unwrap();

        let fetched = store.fetch_zone_changes(&zone, Some(&first.new_token), 100).await;
        let second = page(fetched.unwrap());
        let names: Vec<_> = second.changed.iter().map(|r| r.record_name.as_str()).collect();
        assert_eq!(names, vec!["c"]);
        assert_eq!(second.deleted.len(), 1);
        assert_eq!(second.deleted[0].record_name, "b");

        let fetched = store.fetch_zone_changes(&zone, Some(&second.new_token), 100).await;
        let third = page(fetched.unwrap());
        assert!(third.changed.is_empty() && third.deleted.is_empty());
        assert_eq!(third.new_token, second.new_token);
    }

    #[tokio::test]
    async fn test_paging() {
        let store = store().await;
        let zone = ZoneId::default();
        for name in ["a", "b", "c", "d", "e"] {
            store.save_record(record(name)).await.unwrap();
        }

        let mut token = None;
        let mut seen = Vec::new();
        loop {
            let p = page(store.fetch_zone_changes(&zone, token.as_ref(), 2).await.unwrap());
            seen.extend(p.changed.iter().map(|r| r.record_name.clone()));
            token = Some(p.new_token);
            if !p.more_coming {
                break;
            }
        }
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_stale_change_tag_conflicts() {
        let store = store().await;

        let saved = match store.save_record(record("a")).await.unwrap() {
            SaveRecordResult::Saved(r) => r,
            other => panic!("unexpected {:?}", other),
        };

        // Second writer never saw the first version.
        match store.save_record(record("a")).await.unwrap() {
            SaveRecordResult::Conflict { server } => {
                assert_eq!(server.change_tag, saved.change_tag)
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut update = record("a");
        update.change_tag = saved.change_tag.clone();
        assert!(matches!(
            store.save_record(update).await.unwrap(),
            SaveRecordResult::Saved(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_tokens() {
        let store = store().await;
        let zone = ZoneId::default();
        store.save_record(record("a")).await.unwrap();
        let p = page(store.fetch_zone_changes(&zone, None, 10).await.unwrap());

        store.expire_tokens(&zone);
        assert_eq!(
            store.fetch_zone_changes(&zone, Some(&p.new_token), 10).await.unwrap(),
            ZoneFetch::TokenExpired
        );
        assert_eq!(
            store.fetch_zone_changes(&zone, Some(&ChangeToken::new(vec![1, 2])), 10).await.unwrap(),
            ZoneFetch::TokenExpired
        );

        let full = page(store.fetch_zone_changes(&zone, None, 10).await.unwrap());
        assert_eq!(full.changed.len(), 1);
        assert_eq!(store.fetch_log().len(), 4);
    }

    #[tokio::test]
    async fn test_subscription_and_notifications() {
        let store = store().await;
        let zone = ZoneId::default();
        let mut rx = store.notifications();

        store.save_record(record("quiet")).await.unwrap();
        assert!(rx.try_recv().is_err());

        let types = vec!["Project".to_string()];
        assert_eq!(store.subscribe(&zone, &types).await.unwrap(), SubscriptionStatus::Created);
        assert_eq!(
            store.subscribe(&zone, &types).await.unwrap(),
            SubscriptionStatus::AlreadyExists
        );

        store.save_record(record("loud")).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), ZoneNotification { zone });
    }

    #[tokio::test]
    async fn test_offline_and_missing_zone() {
        let store = store().await;
        store.set_offline(true);
        assert!(store.save_record(record("a")).await.unwrap_err().is_retryable());
        store.set_offline(false);

        let other = ZoneId::new("Elsewhere");
        assert!(matches!(
            store.fetch_zone_changes(&other, None, 10).await,
            Err(SyncError::ZoneNotFound(_))
        ));
    }
}
