//! # Outbox
//!
//! Pushes the pending change queue to the remote store.
//!
//! ## Flush
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  pending (FIFO)      c1:A  c2:B  c3:A  c4:C  c5:B                      │
//! │                                                                         │
//! │  group by entity     A: [c1, c3]   B: [c2, c5]   C: [c4]               │
//! │                         │             │             │                   │
//! │                         ▼             ▼             ▼    concurrently   │
//! │                      in order      in order      in order               │
//! │                                                                         │
//! │  per change:                                                            │
//! │    saved / deleted ────────► remove from queue                          │
//! │    conflict unresolved ────► remove, report for manual resolution       │
//! │    failed ─────────────────► attempts += 1, stop this entity's group    │
//! │    attempts ≥ max ─────────► remove with a warning                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed change blocks the later changes of the same entity until the
//! next flush, so a newer snapshot never lands before an older one.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::FlushReport;
use crate::local::SyncStateStore;
use crate::resolver::ConflictResolver;
use tandem_core::{ChangeOperation, EntityRef, MergeContext, PendingChange, SyncEntity};

/// Largest number of queued changes read by one flush.
const FLUSH_LIMIT: u32 = 500;

/// What one flush did, including what the store now holds for every
/// entity it confirmed.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub report: FlushReport,
    /// Store versions of saved entities, last one per entity.
    pub saved: Vec<SyncEntity>,
    pub deleted: Vec<EntityRef>,
    pub conflicts: Vec<(EntityRef, u32)>,
}

#[derive(Debug, Default)]
struct GroupOutcome {
    pushed: usize,
    failed: usize,
    dropped: usize,
    last: Option<Pushed>,
    conflicts: Vec<(EntityRef, u32)>,
}

#[derive(Debug)]
enum Pushed {
    Saved(SyncEntity),
    Deleted(EntityRef),
}

pub struct Outbox {
    state: Arc<dyn SyncStateStore>,
    resolver: Arc<ConflictResolver>,
    max_push_attempts: u32,
}

impl Outbox {
    pub fn new(
        state: Arc<dyn SyncStateStore>,
        resolver: Arc<ConflictResolver>,
        max_push_attempts: u32,
    ) -> Self {
        Outbox {
            state,
            resolver,
            max_push_attempts: max_push_attempts.max(1),
        }
    }

    /// Pushes every queued change once.
    pub async fn flush(&self, ctx: &MergeContext) -> SyncResult<FlushOutcome> {
        let changes = self.state.pending(FLUSH_LIMIT).await?;
        if changes.is_empty() {
            debug!("No pending changes");
            return Ok(FlushOutcome::default());
        }

        let groups = group_by_entity(changes);
        info!(entities = groups.len(), "Flushing pending changes");

        let results = join_all(groups.into_iter().map(|group| self.flush_group(group, ctx))).await;

        let mut outcome = FlushOutcome::default();
        for group in results {
            outcome.report.pushed += group.pushed;
            outcome.report.failed += group.failed;
            outcome.report.dropped += group.dropped;
            outcome.report.conflicts += group.conflicts.len();
            outcome.conflicts.extend(group.conflicts);
            match group.last {
                Some(Pushed::Saved(entity)) => outcome.saved.push(entity),
                Some(Pushed::Deleted(entity_ref)) => outcome.deleted.push(entity_ref),
                None => {}
            }
        }

        info!(
            pushed = outcome.report.pushed,
            failed = outcome.report.failed,
            dropped = outcome.report.dropped,
            conflicts = outcome.report.conflicts,
            "Flush finished"
        );
        Ok(outcome)
    }

    /// Pushes one entity's changes in queue order.
    async fn flush_group(&self, group: Vec<PendingChange>, ctx: &MergeContext) -> GroupOutcome {
        let mut outcome = GroupOutcome::default();
        let total = group.len();

        for (index, change) in group.into_iter().enumerate() {
            if change.attempts >= self.max_push_attempts {
                warn!(
                    entity = %change.entity_ref,
                    attempts = change.attempts,
                    last_error = ?change.last_error,
                    "Dropping change that exceeded max push attempts"
                );
                self.remove(&change).await;
                outcome.dropped += 1;
                continue;
            }

            match self.push(&change, ctx).await {
                Ok(pushed) => {
                    self.remove(&change).await;
                    outcome.pushed += 1;
                    outcome.last = Some(pushed);
                }
                Err(SyncError::ConflictUnresolved { entity, attempts }) => {
                    self.remove(&change).await;
                    outcome.conflicts.push((entity, attempts));
                }
                Err(SyncError::InvalidRecord(reason)) => {
                    warn!(
                        entity = %change.entity_ref,
                        reason = %reason,
                        "Dropping unpushable change"
                    );
                    self.remove(&change).await;
                    outcome.dropped += 1;
                }
                Err(e) => {
                    let recorded = self.state.record_failure(change.id, &e.to_string()).await;
                    let attempts = match recorded {
                        Ok(attempts) => attempts,
                        Err(store_err) => {
                            warn!(error = %store_err, "Failed to record push failure");
                            change.attempts + 1
                        }
                    };
                    debug!(entity = %change.entity_ref, attempts, error = %e, "Push failed");

                    if attempts >= self.max_push_attempts {
                        warn!(
                            entity = %change.entity_ref,
                            attempts,
                            error = %e,
                            "Giving up on change"
                        );
                        self.remove(&change).await;
                        outcome.dropped += 1;
                        outcome.failed += total - index - 1;
                    } else {
                        outcome.failed += total - index;
                    }
                    break;
                }
            }
        }

        outcome
    }

    async fn push(&self, change: &PendingChange, ctx: &MergeContext) -> SyncResult<Pushed> {
        match change.operation {
            ChangeOperation::Create | ChangeOperation::Update => {
                let entity = change.entity.as_ref().ok_or_else(|| {
                    SyncError::InvalidRecord("queued change has no snapshot".into())
                })?;
                let saved = self.resolver.save_with_merge(entity, ctx).await?;
                Ok(Pushed::Saved(saved))
            }
            ChangeOperation::Delete => {
                self.resolver.delete_entity(&change.entity_ref).await?;
                Ok(Pushed::Deleted(change.entity_ref.clone()))
            }
        }
    }

    async fn remove(&self, change: &PendingChange) {
        if let Err(e) = self.state.remove_pending(change.id).await {
            warn!(id = %change.id, error = %e, "Failed to remove pending change");
        }
    }
}

/// Splits the queue into per-entity runs, keeping queue order inside each
/// run and ordering runs by their first change.
fn group_by_entity(changes: Vec<PendingChange>) -> Vec<Vec<PendingChange>> {
    let mut index: HashMap<EntityRef, usize> = HashMap::new();
    let mut groups: Vec<Vec<PendingChange>> = Vec::new();

    for change in changes {
        match index.get(&change.entity_ref) {
            Some(&slot) => groups[slot].push(change),
            None => {
                index.insert(change.entity_ref.clone(), groups.len());
                groups.push(vec![change]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughCipher;
    use crate::local::MemoryStateStore;
    use crate::remote::{FetchOutcome, MemoryRecordStore, RemoteStoreClient};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tandem_core::{Project, ZoneId};

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        client: Arc<RemoteStoreClient>,
        state: Arc<MemoryStateStore>,
        outbox: Outbox,
    }

    async fn fixture(max_push_attempts: u32) -> Fixture {
        let store = Arc::new(MemoryRecordStore::new());
        let client =
            Arc::new(RemoteStoreClient::new(store.clone(), Arc::new(PassthroughCipher), 50));
        client.create_zone_if_absent(&ZoneId::default()).await.unwrap();
        let resolver = Arc::new(ConflictResolver::new(client.clone(), 3));
        let state = Arc::new(MemoryStateStore::new());
        let outbox = Outbox::new(state.clone(), resolver, max_push_attempts);
        Fixture {
            store,
            client,
            state,
            outbox,
        }
    }

    fn project(name: &str) -> Project {
        Project::new(ZoneId::default(), name, Utc::now())
    }

    #[test]
    fn test_group_by_entity_keeps_order() {
        let a = project("a");
        let b = project("b");
        let changes = vec![
            PendingChange::create(a.clone().into()),
            PendingChange::create(b.clone().into()),
            PendingChange::update(a.clone().into()),
        ];
        let ids: Vec<_> = changes.iter().map(|c| c.id).collect();

        let groups = group_by_entity(changes);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].iter().map(|c| c.id).collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        assert_eq!(groups[1][0].id, ids[1]);
    }

    #[tokio::test]
    async fn test_flush_pushes_in_order_and_empties_queue() {
        let f = fixture(10).await;
        let mut atlas = project("Atlas");
        f.state.enqueue(&PendingChange::create(atlas.clone().into())).await.unwrap();
        atlas.name = "Atlas v2".into();
        atlas.last_modified = atlas.last_modified + chrono::Duration::seconds(1);
        f.state.enqueue(&PendingChange::update(atlas.clone().into())).await.unwrap();
        f.state.enqueue(&PendingChange::create(project("Borealis").into())).await.unwrap();

        let outcome = f.outbox.flush(&MergeContext::default()).await.unwrap();
        assert_eq!(outcome.report.pushed, 3);
        assert_eq!(outcome.saved.len(), 2);
        assert_eq!(f.state.pending_count().await.unwrap(), 0);

        let FetchOutcome::Changes { changed, .. } =
            f.client.fetch_changes(&ZoneId::default(), None).await.unwrap()
        else {
            panic!("expected changes");
        };
        assert_eq!(changed.len(), 2);
        assert!(changed.contains(&SyncEntity::Project(atlas)));
    }

    #[tokio::test]
    async fn test_failures_keep_change_until_max_attempts() {
        let f = fixture(2).await;
        f.state.enqueue(&PendingChange::create(project("Atlas").into())).await.unwrap();
        f.store.set_offline(true);

        let outcome = f.outbox.flush(&MergeContext::default()).await.unwrap();
        assert_eq!(outcome.report.failed, 1);
        assert_eq!(f.state.pending(1).await.unwrap()[0].attempts, 1);

        let outcome = f.outbox.flush(&MergeContext::default()).await.unwrap();
        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(f.state.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_blocks_later_changes_of_same_entity() {
        let f = fixture(10).await;
        let atlas = project("Atlas");
        f.state.enqueue(&PendingChange::create(atlas.clone().into())).await.unwrap();
        f.state.enqueue(&PendingChange::update(atlas.into())).await.unwrap();
        f.store.set_offline(true);

        let outcome = f.outbox.flush(&MergeContext::default()).await.unwrap();
        assert_eq!(outcome.report.failed, 2);
        let queued = f.state.pending(10).await.unwrap();
        assert_eq!(queued.iter().map(|c| c.attempts).collect::<Vec<_>>(), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_delete_is_pushed() {
        let f = fixture(10).await;
        let atlas: SyncEntity = project("Atlas").into();
        f.state.enqueue(&PendingChange::create(atlas.clone())).await.unwrap();
        f.outbox.flush(&MergeContext::default()).await.unwrap();
        assert_eq!(f.store.record_count(&ZoneId::default()), 1);

        f.state.enqueue(&PendingChange::delete(atlas.entity_ref())).await.unwrap();
        let outcome = f.outbox.flush(&MergeContext::default()).await.unwrap();
        assert_eq!(outcome.deleted, vec![atlas.entity_ref()]);
        assert_eq!(f.store.record_count(&ZoneId::default()), 0);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_dropped() {
        let f = fixture(10).await;
        let mut change = PendingChange::update(project("Atlas").into());
        change.entity = None;
        f.state.enqueue(&change).await.unwrap();

        let outcome = f.outbox.flush(&MergeContext::default()).await.unwrap();
        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(f.state.pending_count().await.unwrap(), 0);
    }
}
