//! PostgreSQL device store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use secrecy::ExposeSecret;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::{DeviceIdentity, DeviceStore};
use crate::client::Jid;
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Device store backed by a PostgreSQL connection pool.
pub struct PgDeviceStore {
    pool: Pool,
}

impl PgDeviceStore {
    /// Build the pool, verify connectivity and apply migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool_config = Config {
            url: Some(config.url.expose_secret().to_string()),
            pool: Some(PoolConfig::new(config.pool_size)),
            ..Default::default()
        };
        let pool = pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    async fn migrate(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let report = embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(migration = %migration, "Applied device store migration");
        }
        Ok(())
    }

    async fn first_device(&self) -> Result<Option<DeviceIdentity>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT id, jid, registration_id, identity_key, created_at
                FROM devices
                ORDER BY created_at ASC
                LIMIT 1
                "#,
                &[],
            )
            .await?;
        row.map(|r| row_to_device(&r)).transpose()
    }
}

fn row_to_device(row: &Row) -> Result<DeviceIdentity, DatabaseError> {
    let jid: Option<String> = row.get("jid");
    let jid = jid
        .map(|raw| raw.parse::<Jid>())
        .transpose()
        .map_err(|e| DatabaseError::Query(format!("corrupt jid column: {}", e)))?;
    let registration_id: i32 = row.get("registration_id");
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(DeviceIdentity {
        id: row.get("id"),
        jid,
        registration_id: registration_id as u32,
        identity_key: row.get("identity_key"),
        created_at,
    })
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn get_or_create_device(&self) -> Result<DeviceIdentity, DatabaseError> {
        if let Some(device) = self.first_device().await? {
            return Ok(device);
        }

        let device = DeviceIdentity::generate();
        let registration_id = device.registration_id as i32;
        self.conn()
            .await?
            .execute(
                r#"
                INSERT INTO devices (id, jid, registration_id, identity_key, created_at, updated_at)
                VALUES ($1, NULL, $2, $3, $4, $4)
                ON CONFLICT DO NOTHING
                "#,
                &[
                    &device.id,
                    &registration_id,
                    &device.identity_key,
                    &device.created_at,
                ],
            )
            .await?;

        // `devices_singleton_idx` turns a losing concurrent insert into a no-op.
        let device = self
            .first_device()
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                id: device.id.to_string(),
            })?;
        tracing::info!(device_id = %device.id, "Using device identity");
        Ok(device)
    }

    async fn mark_paired(&self, device_id: Uuid, jid: &Jid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let jid = jid.to_string();
        let updated = conn
            .execute(
                "UPDATE devices SET jid = $2, updated_at = NOW() WHERE id = $1",
                &[&device_id, &jid],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                id: device_id.to_string(),
            });
        }
        Ok(())
    }

    async fn invalidate(&self, device_id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM devices WHERE id = $1", &[&device_id])
            .await?;
        tracing::info!(device_id = %device_id, "Invalidated device identity");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute("SELECT 1", &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use secrecy::SecretString;

    use super::*;

    #[test]
    fn test_migrations_enforce_single_device_row() {
        let runner = embedded::migrations::runner();
        let singleton = runner
            .get_migrations()
            .iter()
            .filter_map(|m| m.sql())
            .any(|sql| sql.contains("CREATE UNIQUE INDEX IF NOT EXISTS devices_singleton_idx"));
        assert!(singleton);
    }

    #[tokio::test]
    #[ignore = "requires a disposable PostgreSQL database in DATABASE_URL"]
    async fn test_concurrent_creators_share_one_identity() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PgDeviceStore::connect(&DatabaseConfig {
            url: SecretString::from(url),
            pool_size: 8,
        })
        .await
        .unwrap();
        store
            .conn()
            .await
            .unwrap()
            .execute("DELETE FROM devices", &[])
            .await
            .unwrap();

        let creators = (0..8).map(|_| store.get_or_create_device());
        let devices = futures::future::join_all(creators).await;

        let ids: HashSet<Uuid> = devices.into_iter().map(|d| d.unwrap().id).collect();
        assert_eq!(ids.len(), 1);
        let rows: i64 = store
            .conn()
            .await
            .unwrap()
            .query_one("SELECT COUNT(*) FROM devices", &[])
            .await
            .unwrap()
            .get(0);
        assert_eq!(rows, 1);
    }
}
