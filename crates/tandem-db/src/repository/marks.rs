//! # Sync Mark Repository
//!
//! Named timestamps. The orchestrator keeps one per zone recording when
//! remote settings were last applied.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct SyncMarkRepository {
    pool: SqlitePool,
}

impl SyncMarkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncMarkRepository { pool }
    }

    pub async fn get(&self, scope: &str) -> DbResult<Option<DateTime<Utc>>> {
        let marked: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT marked_at FROM sync_marks WHERE scope = ?1")
                .bind(scope)
                .fetch_optional(&self.pool)
                .await?;

        Ok(marked)
    }

    /// Moves the mark forward. An older timestamp never replaces a newer one.
    pub async fn advance(&self, scope: &str, at: DateTime<Utc>) -> DbResult<()> {
        let current = self.get(scope).await?;
        if current.is_some_and(|c| c >= at) {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO sync_marks (scope, marked_at) VALUES (?1, ?2)
            ON CONFLICT(scope) DO UPDATE SET marked_at = excluded.marked_at
            "#,
        )
        .bind(scope)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
