//! # Change Token Repository
//!
//! One opaque token per zone. The bytes are stored verbatim and never
//! interpreted here.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use tandem_core::{ChangeToken, ZoneId};

/// Repository for per-zone change tokens.
#[derive(Debug, Clone)]
pub struct ChangeTokenRepository {
    pool: SqlitePool,
}

impl ChangeTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ChangeTokenRepository { pool }
    }

    /// Returns the stored token, or `None` for a zone never synced.
    ///
    /// An empty blob is treated as absent.
    pub async fn get(&self, zone: &ZoneId) -> DbResult<Option<ChangeToken>> {
        let token: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT token FROM change_tokens WHERE zone = ?1")
                .bind(zone.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(token.filter(|bytes| !bytes.is_empty()).map(ChangeToken::new))
    }

    /// Stores the token for a zone, replacing any previous one.
    pub async fn put(&self, zone: &ZoneId, token: &ChangeToken) -> DbResult<()> {
        debug!(zone = %zone, token = ?token, "Persisting change token");

        sqlx::query(
            r#"
            INSERT INTO change_tokens (zone, token, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(zone) DO UPDATE SET
                token = excluded.token,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(zone.as_str())
        .bind(token.as_bytes())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Forgets the token so the next fetch starts from full history.
    pub async fn clear(&self, zone: &ZoneId) -> DbResult<()> {
        debug!(zone = %zone, "Clearing change token");

        sqlx::query("DELETE FROM change_tokens WHERE zone = ?1")
            .bind(zone.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
