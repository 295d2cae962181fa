//! # Pending Change Repository
//!
//! Durable queue of local mutations not yet confirmed by the remote store.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL EDIT (e.g., message appended)                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT INTO pending_changes (operation, entity, payload)              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            FLUSH (batch threshold or timer)                     │   │
//! │  │                                                                 │   │
//! │  │  1. SELECT * FROM pending_changes ORDER BY seq                 │   │
//! │  │                                                                 │   │
//! │  │  2. For each entity group:                                     │   │
//! │  │     a. Save to remote store (merge + retry on conflict)        │   │
//! │  │     b. On success: DELETE FROM pending_changes WHERE id = ?    │   │
//! │  │     c. On failure: attempts += 1, last_error = ?               │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • Edits survive restarts (queue is on disk)                           │
//! │  • Per-entity order is preserved (seq is monotonic)                    │
//! │  • Offline? Entries queue up until the next flush                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tandem_core::{ChangeOperation, EntityKind, EntityRef, PendingChange, SyncEntity, ZoneId};

/// Repository for the pending change queue.
#[derive(Debug, Clone)]
pub struct PendingChangeRepository {
    pool: SqlitePool,
}

impl PendingChangeRepository {
    /// Creates a new PendingChangeRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PendingChangeRepository { pool }
    }

    /// Appends a change to the queue.
    pub async fn enqueue(&self, change: &PendingChange) -> DbResult<()> {
        let payload = change
            .entity
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::corrupt("pending_changes", change.id.to_string(), e))?;

        debug!(
            entity = %change.entity_ref,
            operation = change.operation.as_str(),
            "Queuing pending change"
        );

        sqlx::query(
            r#"
            INSERT INTO pending_changes (
                id, operation, entity_kind, entity_id, zone,
                payload, enqueued_at, attempts, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(change.id.to_string())
        .bind(change.operation.as_str())
        .bind(change.entity_ref.kind.record_type())
        .bind(change.entity_ref.id.to_string())
        .bind(change.entity_ref.zone.as_str())
        .bind(payload)
        .bind(change.enqueued_at)
        .bind(change.attempts as i64)
        .bind(change.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns up to `limit` queued changes, oldest first.
    ///
    /// Rows that cannot be decoded are deleted with a warning, and the scan
    /// continues past them so a corrupt head never starves the queue.
    pub async fn list(&self, limit: u32) -> DbResult<Vec<PendingChange>> {
        let wanted = limit as usize;
        let mut changes = Vec::with_capacity(wanted);
        let mut after_seq = 0i64;

        while changes.len() < wanted {
            let page = (wanted - changes.len()) as i64;
            let rows = sqlx::query(
                r#"
                SELECT seq, id, operation, entity_kind, entity_id, zone,
                       payload, enqueued_at, attempts, last_error
                FROM pending_changes
                WHERE seq > ?1
                ORDER BY seq ASC
                LIMIT ?2
                "#,
            )
            .bind(after_seq)
            .bind(page)
            .fetch_all(&self.pool)
            .await?;

            let fetched = rows.len() as i64;
            for row in rows {
                let seq: i64 = row.try_get("seq")?;
                after_seq = seq;
                match decode_row(&row) {
                    Ok(change) => changes.push(change),
                    Err(e) => {
                        warn!(seq, error = %e, "Dropping unreadable pending change");
                        self.discard(seq).await?;
                    }
                }
            }
            if fetched < page {
                break;
            }
        }
        Ok(changes)
    }

    async fn discard(&self, seq: i64) -> DbResult<()> {
        sqlx::query("DELETE FROM pending_changes WHERE seq = ?1")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes a confirmed change. Returns false if it was already gone.
    pub async fn remove(&self, id: Uuid) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM pending_changes WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records a failed push and returns the new attempt count.
    pub async fn record_failure(&self, id: Uuid, error: &str) -> DbResult<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE pending_changes SET
                attempts = attempts + 1,
                last_error = ?2
            WHERE id = ?1
            RETURNING attempts
            "#,
        )
        .bind(id.to_string())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|a| a as u32)
            .ok_or_else(|| DbError::not_found("PendingChange", id.to_string()))
    }

    /// Counts queued changes.
    pub async fn count(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_changes")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}

fn decode_row(row: &SqliteRow) -> DbResult<PendingChange> {
    let raw_id: String = row.try_get("id")?;
    let corrupt = |reason: String| DbError::corrupt("pending_changes", raw_id.clone(), reason);

    let id = Uuid::parse_str(&raw_id).map_err(|e| corrupt(e.to_string()))?;
    let operation = ChangeOperation::from_str(row.try_get::<&str, _>("operation")?)
        .map_err(|e| corrupt(e.to_string()))?;
    let kind_name: String = row.try_get("entity_kind")?;
    let kind = EntityKind::from_record_type(&kind_name)
        .ok_or_else(|| corrupt(format!("unknown kind {kind_name}")))?;
    let entity_id = Uuid::parse_str(row.try_get::<&str, _>("entity_id")?)
        .map_err(|e| corrupt(e.to_string()))?;
    let zone = ZoneId::new(row.try_get::<String, _>("zone")?);

    let entity = row
        .try_get::<Option<String>, _>("payload")?
        .map(|json| serde_json::from_str::<SyncEntity>(&json))
        .transpose()
        .map_err(|e| corrupt(e.to_string()))?;

    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(PendingChange {
        id,
        operation,
        entity_ref: EntityRef::new(kind, entity_id, zone),
        entity,
        enqueued_at,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use tandem_core::Project;

    async fn repo() -> PendingChangeRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().pending_changes()
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let repo = repo().await;
        let first = PendingChange::create(Project::new(ZoneId::default(), "a", Utc::now()).into());
        let second = PendingChange::create(Project::new(ZoneId::default(), "b", Utc::now()).into());

        repo.enqueue(&first).await.unwrap();
        repo.enqueue(&second).await.unwrap();

        let listed = repo.list(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], first);
        assert_eq!(listed[1].id, second.id);
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failure_and_removal() {
        let repo = repo().await;
        let project = Project::new(ZoneId::default(), "gone", Utc::now());
        let change = PendingChange::delete(SyncEntity::from(project).entity_ref());
        repo.enqueue(&change).await.unwrap();

        assert_eq!(repo.record_failure(change.id, "offline").await.unwrap(), 1);
        assert_eq!(repo.record_failure(change.id, "offline").await.unwrap(), 2);

        let listed = repo.list(10).await.unwrap();
        assert_eq!(listed[0].attempts, 2);
        assert_eq!(listed[0].last_error.as_deref(), Some("offline"));
        assert!(listed[0].entity.is_none());

        assert!(repo.remove(change.id).await.unwrap());
        assert!(!repo.remove(change.id).await.unwrap());
        assert!(repo.record_failure(change.id, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_skipped() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.pending_changes();
        let good = PendingChange::create(Project::new(ZoneId::default(), "ok", Utc::now()).into());
        repo.enqueue(&good).await.unwrap();

        sqlx::query(
            "INSERT INTO pending_changes
                 (id, operation, entity_kind, entity_id, zone, payload, enqueued_at)
             VALUES
                 ('broken', 'update', 'Project', 'nope', 'TandemZone', '{',
                  '2026-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let listed = repo.list(10).await.unwrap();
        assert_eq!(listed, vec![good]);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_head_does_not_block_the_queue() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.pending_changes();

        for n in 0..5 {
            sqlx::query(
                "INSERT INTO pending_changes
                     (id, operation, entity_kind, entity_id, zone, payload, enqueued_at)
                 VALUES
                     (?1, 'update', 'Project', 'nope', 'TandemZone', '{', '2026-01-01T00:00:00Z')",
            )
            .bind(format!("broken-{n}"))
            .execute(db.pool())
            .await
            .unwrap();
        }
        let behind = Project::new(ZoneId::default(), "behind", Utc::now());
        let good = PendingChange::create(behind.into());
        repo.enqueue(&good).await.unwrap();

        let listed = repo.list(2).await.unwrap();
        assert_eq!(listed, vec![good]);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
