//! Default `PersistentStore` backend (spec §1, "Persistent Store";
//! `SPEC_FULL.md` §1.F). Grounded on `db/mod.rs`'s connect-with-WAL and
//! manual migration runner, adapted from a bare connection pool into a
//! concrete implementation of the `PersistentStore` collaborator trait.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::collab::{AttributeReport, DeviceMetadata, PeerAddress, PersistentStore};
use crate::error::{ControllerError, Result};

const INIT_MIGRATION: &str = include_str!("migrations/001_init.sql");

/// SQLite-backed `PersistentStore`.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| ControllerError::Internal(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ControllerError::Internal(e.to_string()))?;

        run_migrations(&pool).await?;
        info!("Database migrations applied");

        Ok(Self { pool })
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (\
         version INTEGER PRIMARY KEY, \
         applied_at TEXT NOT NULL DEFAULT (datetime('now')))",
    )
    .execute(pool)
    .await
    .map_err(|e| ControllerError::Internal(e.to_string()))?;

    let applied: bool = sqlx::query("SELECT 1 FROM _migrations WHERE version = 1")
        .fetch_optional(pool)
        .await
        .map_err(|e| ControllerError::Internal(e.to_string()))?
        .is_some();

    if !applied {
        for statement in INIT_MIGRATION.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() || stmt.starts_with("--") {
                continue;
            }
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(|e| ControllerError::Internal(e.to_string()))?;
        }

        sqlx::query("INSERT INTO _migrations (version) VALUES (1)")
            .execute(pool)
            .await
            .map_err(|e| ControllerError::Internal(e.to_string()))?;

        info!("Applied migration 001_init.sql");
    }

    Ok(())
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn load_attributes(&self, peer: PeerAddress) -> Result<Vec<AttributeReport>> {
        let rows = sqlx::query(
            "SELECT endpoint, cluster_id, attribute_id, value, data_version \
             FROM attributes WHERE fabric_id = ? AND node_id = ?",
        )
        .bind(peer.fabric_id as i64)
        .bind(peer.node_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ControllerError::Internal(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let value_text: String = row.try_get("value").map_err(db_err)?;
                let value = serde_json::from_str(&value_text).map_err(|e| {
                    ControllerError::Internal(format!("corrupt cached attribute value: {e}"))
                })?;
                Ok(AttributeReport {
                    endpoint: row.try_get::<i64, _>("endpoint").map_err(db_err)? as u16,
                    cluster_id: row.try_get::<i64, _>("cluster_id").map_err(db_err)? as u32,
                    attribute_id: row.try_get::<i64, _>("attribute_id").map_err(db_err)? as u32,
                    value,
                    data_version: row.try_get::<i64, _>("data_version").map_err(db_err)? as u32,
                })
            })
            .collect()
    }

    async fn save_attributes(&self, peer: PeerAddress, reports: &[AttributeReport]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ControllerError::Internal(e.to_string()))?;

        for report in reports {
            let value_text = serde_json::to_string(&report.value)
                .map_err(|e| ControllerError::Internal(e.to_string()))?;
            sqlx::query(
                "INSERT INTO attributes \
                 (fabric_id, node_id, endpoint, cluster_id, attribute_id, value, data_version) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(fabric_id, node_id, endpoint, cluster_id, attribute_id) \
                 DO UPDATE SET value = excluded.value, data_version = excluded.data_version",
            )
            .bind(peer.fabric_id as i64)
            .bind(peer.node_id as i64)
            .bind(report.endpoint as i64)
            .bind(report.cluster_id as i64)
            .bind(report.attribute_id as i64)
            .bind(value_text)
            .bind(report.data_version as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| ControllerError::Internal(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| ControllerError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn load_device_metadata(&self, peer: PeerAddress) -> Result<Option<DeviceMetadata>> {
        let row = sqlx::query(
            "SELECT sii_ms, sai_ms, sat_ms, tcp_supported, icd \
             FROM device_metadata WHERE fabric_id = ? AND node_id = ?",
        )
        .bind(peer.fabric_id as i64)
        .bind(peer.node_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ControllerError::Internal(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(DeviceMetadata {
            sii_ms: row
                .try_get::<Option<i64>, _>("sii_ms")
                .map_err(db_err)?
                .map(|v| v as u32),
            sai_ms: row
                .try_get::<Option<i64>, _>("sai_ms")
                .map_err(db_err)?
                .map(|v| v as u32),
            sat_ms: row
                .try_get::<Option<i64>, _>("sat_ms")
                .map_err(db_err)?
                .map(|v| v as u32),
            tcp_supported: row.try_get::<i64, _>("tcp_supported").map_err(db_err)? != 0,
            icd: row.try_get::<i64, _>("icd").map_err(db_err)? != 0,
        }))
    }

    async fn save_device_metadata(&self, peer: PeerAddress, metadata: &DeviceMetadata) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_metadata \
             (fabric_id, node_id, sii_ms, sai_ms, sat_ms, tcp_supported, icd) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(fabric_id, node_id) DO UPDATE SET \
             sii_ms = excluded.sii_ms, sai_ms = excluded.sai_ms, sat_ms = excluded.sat_ms, \
             tcp_supported = excluded.tcp_supported, icd = excluded.icd",
        )
        .bind(peer.fabric_id as i64)
        .bind(peer.node_id as i64)
        .bind(metadata.sii_ms.map(|v| v as i64))
        .bind(metadata.sai_ms.map(|v| v as i64))
        .bind(metadata.sat_ms.map(|v| v as i64))
        .bind(metadata.tcp_supported as i64)
        .bind(metadata.icd as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| ControllerError::Internal(e.to_string()))?;

        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> ControllerError {
    ControllerError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddress {
        PeerAddress::new(1, 42)
    }

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn fresh_store_has_no_metadata_or_attributes() {
        let store = store().await;
        assert!(store.load_device_metadata(peer()).await.unwrap().is_none());
        assert!(store.load_attributes(peer()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_metadata_round_trips() {
        let store = store().await;
        let metadata = DeviceMetadata {
            sii_ms: Some(500),
            sai_ms: Some(300),
            sat_ms: None,
            tcp_supported: true,
            icd: true,
        };
        store.save_device_metadata(peer(), &metadata).await.unwrap();
        let loaded = store.load_device_metadata(peer()).await.unwrap().unwrap();
        assert_eq!(loaded, metadata);
    }

    #[tokio::test]
    async fn saving_metadata_twice_overwrites_rather_than_duplicates() {
        let store = store().await;
        let first = DeviceMetadata {
            icd: false,
            ..Default::default()
        };
        let second = DeviceMetadata {
            icd: true,
            sii_ms: Some(100),
            ..Default::default()
        };
        store.save_device_metadata(peer(), &first).await.unwrap();
        store.save_device_metadata(peer(), &second).await.unwrap();
        let loaded = store.load_device_metadata(peer()).await.unwrap().unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn save_then_load_attributes_round_trips_and_dedupes_by_key() {
        let store = store().await;
        let reports = vec![
            AttributeReport {
                endpoint: 0,
                cluster_id: 0x001d,
                attribute_id: 3,
                value: serde_json::json!([1, 2]),
                data_version: 1,
            },
            AttributeReport {
                endpoint: 1,
                cluster_id: 0x0028,
                attribute_id: 0,
                value: serde_json::json!("vendor"),
                data_version: 2,
            },
        ];
        store.save_attributes(peer(), &reports).await.unwrap();

        let updated = AttributeReport {
            data_version: 5,
            value: serde_json::json!([1, 2, 3]),
            ..reports[0]
        };
        store
            .save_attributes(peer(), std::slice::from_ref(&updated))
            .await
            .unwrap();

        let mut loaded = store.load_attributes(peer()).await.unwrap();
        loaded.sort_by_key(|r| (r.endpoint, r.cluster_id, r.attribute_id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], updated);
        assert_eq!(loaded[1], reports[1]);
    }

    #[tokio::test]
    async fn attributes_are_scoped_per_peer() {
        let store = store().await;
        let other = PeerAddress::new(1, 43);
        let report = AttributeReport {
            endpoint: 0,
            cluster_id: 0x0028,
            attribute_id: 0,
            value: serde_json::json!(1),
            data_version: 1,
        };
        store.save_attributes(peer(), &[report]).await.unwrap();
        assert!(store.load_attributes(other).await.unwrap().is_empty());
    }
}
