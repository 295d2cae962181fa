//! # Entity Repository
//!
//! Local copies of synchronized entities, stored as JSON keyed by kind and
//! id. This is the daemon's local store; an embedding application with its
//! own storage supplies a different one.

use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tandem_core::{EntityKind, SyncEntity};

#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
}

impl EntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EntityRepository { pool }
    }

    pub async fn get(&self, kind: EntityKind, id: Uuid) -> DbResult<Option<SyncEntity>> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM entities WHERE entity_kind = ?1 AND entity_id = ?2",
        )
        .bind(kind.record_type())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        payload
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| DbError::corrupt("entities", id.to_string(), e))
            })
            .transpose()
    }

    /// Inserts or replaces an entity.
    pub async fn upsert(&self, entity: &SyncEntity) -> DbResult<()> {
        let payload = serde_json::to_string(entity)
            .map_err(|e| DbError::corrupt("entities", entity.id().to_string(), e))?;

        debug!(entity = %entity.entity_ref(), "Storing entity");

        sqlx::query(
            r#"
            INSERT INTO entities (entity_kind, entity_id, zone, payload, modified_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_kind, entity_id) DO UPDATE SET
                zone = excluded.zone,
                payload = excluded.payload,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(entity.kind().record_type())
        .bind(entity.id().to_string())
        .bind(entity.zone().as_str())
        .bind(payload)
        .bind(entity.modified_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes an entity. Returns false if it did not exist.
    pub async fn delete(&self, kind: EntityKind, id: Uuid) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM entities WHERE entity_kind = ?1 AND entity_id = ?2")
            .bind(kind.record_type())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists every entity of one kind, most recently modified first.
    pub async fn list(&self, kind: EntityKind) -> DbResult<Vec<SyncEntity>> {
        let rows = sqlx::query(
            "SELECT entity_id, payload FROM entities
             WHERE entity_kind = ?1
             ORDER BY modified_at DESC",
        )
        .bind(kind.record_type())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("entity_id")?;
                let payload: String = row.try_get("payload")?;
                serde_json::from_str(&payload).map_err(|e| DbError::corrupt("entities", id, e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Utc;
    use tandem_core::{Conversation, Message, MessageRole, ZoneId};

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.entities();

        let mut convo = Conversation::new(ZoneId::default(), "Recipes", Utc::now());
        let message = Message::new(&convo, MessageRole::User, "soup?", Utc::now());
        convo.append_message(message);
        let entity = SyncEntity::from(convo.clone());

        repo.upsert(&entity).await.unwrap();
        assert_eq!(
            repo.get(EntityKind::Conversation, convo.id).await.unwrap(),
            Some(entity.clone())
        );

        convo.title = "Soup recipes".into();
        repo.upsert(&convo.clone().into()).await.unwrap();
        assert_eq!(repo.list(EntityKind::Conversation).await.unwrap().len(), 1);

        assert!(repo.delete(EntityKind::Conversation, convo.id).await.unwrap());
        assert_eq!(repo.get(EntityKind::Conversation, convo.id).await.unwrap(), None);
        assert!(!repo.delete(EntityKind::Conversation, convo.id).await.unwrap());
    }
}
