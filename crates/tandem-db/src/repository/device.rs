//! # Device Profile Repository
//!
//! The single row describing this device.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{DbError, DbResult};
use tandem_core::{DeviceClass, DeviceProfile};

#[derive(Debug, Clone)]
pub struct DeviceProfileRepository {
    pool: SqlitePool,
}

impl DeviceProfileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeviceProfileRepository { pool }
    }

    pub async fn load(&self) -> DbResult<Option<DeviceProfile>> {
        let row = sqlx::query(
            "SELECT device_id, display_name, device_class, last_active_at
             FROM device_profile WHERE slot = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let device_id: String = row.try_get("device_id")?;
        let class_name: String = row.try_get("device_class")?;
        let device_class = DeviceClass::from_str(&class_name)
            .map_err(|e| DbError::corrupt("device_profile", device_id.clone(), e))?;
        let last_active_at: DateTime<Utc> = row.try_get("last_active_at")?;

        Ok(Some(DeviceProfile {
            device_id,
            display_name: row.try_get("display_name")?,
            device_class,
            last_active_at,
        }))
    }

    pub async fn save(&self, profile: &DeviceProfile) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO device_profile (slot, device_id, display_name, device_class, last_active_at)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT(slot) DO UPDATE SET
                device_id = excluded.device_id,
                display_name = excluded.display_name,
                device_class = excluded.device_class,
                last_active_at = excluded.last_active_at
            "#,
        )
        .bind(&profile.device_id)
        .bind(&profile.display_name)
        .bind(profile.device_class.as_str())
        .bind(profile.last_active_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads the stored profile, or generates and persists a new one.
    ///
    /// A stored profile keeps its id; name and class follow the arguments.
    pub async fn load_or_create(
        &self,
        display_name: &str,
        device_class: DeviceClass,
    ) -> DbResult<DeviceProfile> {
        let profile = match self.load().await? {
            Some(mut existing) => {
                existing.display_name = display_name.to_string();
                existing.device_class = device_class;
                existing.touch(Utc::now());
                existing
            }
            None => {
                let created = DeviceProfile::generate(display_name, device_class);
                info!(device_id = %created.device_id, "Generated device identity");
                created
            }
        };

        self.save(&profile).await?;
        Ok(profile)
    }
}
