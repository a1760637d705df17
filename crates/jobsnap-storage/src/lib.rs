//! Project + snapshot persistence for jobsnap, backed by SQLite.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsnap_core::{Metrics, Project, Snapshot};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, error};

pub const CRATE_NAME: &str = "jobsnap-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("address is required and must be a non-empty string")]
    InvalidAddress,
    #[error("no project with address {0:?}")]
    ProjectNotFound(String),
    #[error("stored capture time {0} is out of range")]
    InvalidTimestamp(i64),
    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Dimension/fact storage contract consumed by the scrape pipeline.
///
/// Addresses are the natural key for projects; snapshots are append-only and
/// read back newest first (capture time, then id).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or update by address. `external_id` only overwrites when present.
    async fn upsert_project(
        &self,
        address: &str,
        active: bool,
        external_id: Option<i64>,
    ) -> Result<Project, StoreError>;

    async fn get_project_by_address(&self, address: &str) -> Result<Option<Project>, StoreError>;

    async fn list_projects(&self, active_only: bool) -> Result<Vec<Project>, StoreError>;

    /// Returns the number of rows changed (0 when the address is unknown).
    async fn set_project_active(&self, address: &str, active: bool) -> Result<u64, StoreError>;

    async fn set_external_id(&self, address: &str, external_id: i64) -> Result<Project, StoreError>;

    async fn append_snapshot(&self, project_id: i64, metrics: &Metrics) -> Result<Snapshot, StoreError>;

    async fn get_latest_snapshot(&self, project_id: i64) -> Result<Option<Snapshot>, StoreError>;

    async fn list_snapshots(&self, project_id: i64, limit: Option<u32>) -> Result<Vec<Snapshot>, StoreError>;

    /// Explicit creation path; an existing row is updated rather than duplicated.
    async fn create_project(&self, address: &str, external_id: Option<i64>) -> Result<Project, StoreError> {
        self.upsert_project(address, true, external_id).await
    }

    async fn latest_for_address(
        &self,
        address: &str,
    ) -> Result<Option<(Project, Option<Snapshot>)>, StoreError> {
        let Some(project) = self.get_project_by_address(address).await? else {
            return Ok(None);
        };
        let snapshot = self.get_latest_snapshot(project.id).await?;
        Ok(Some((project, snapshot)))
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::migrated(pool).await
    }

    /// A private database that lives as long as the store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("snapshot store schema is current");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn snapshot_by_id(&self, id: i64) -> Result<Snapshot, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT *
              FROM snapshot
             WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        snapshot_from_row(&row)
    }
}

fn normalize_address(address: &str) -> Result<&str, StoreError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidAddress);
    }
    Ok(trimmed)
}

fn project_from_row(row: &SqliteRow) -> Result<Project, StoreError> {
    Ok(Project {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        external_id: row.try_get("external_id")?,
        active: row.try_get("active")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot, StoreError> {
    let captured_ms: i64 = row.try_get("captured_at")?;
    let captured_at = DateTime::<Utc>::from_timestamp_millis(captured_ms)
        .ok_or(StoreError::InvalidTimestamp(captured_ms))?;
    Ok(Snapshot {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        captured_at,
        metrics: Metrics {
            estimate_builder_cost: row.try_get("estimate_builder_cost")?,
            estimate_client_price: row.try_get("estimate_client_price")?,
            job_cost: row.try_get("job_cost")?,
            invoice_total: row.try_get("invoice_total")?,
            invoice_paid: row.try_get("invoice_paid")?,
            invoice_due: row.try_get("invoice_due")?,
            change_order_builder_cost: row.try_get("change_order_builder_cost")?,
            change_order_client_price: row.try_get("change_order_client_price")?,
        },
    })
}

fn logged<T>(result: Result<T, sqlx::Error>, what: &str) -> Result<T, StoreError> {
    result.map_err(|err| {
        error!(error = %err, "failed to {what}");
        StoreError::Database(err)
    })
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn upsert_project(
        &self,
        address: &str,
        active: bool,
        external_id: Option<i64>,
    ) -> Result<Project, StoreError> {
        let address = normalize_address(address)?;
        logged(
            sqlx::query(
                r#"
                INSERT INTO project (address, active, external_id)
                VALUES (?, ?, ?)
                ON CONFLICT(address) DO UPDATE SET
                    active = excluded.active,
                    external_id = COALESCE(excluded.external_id, project.external_id)
                "#,
            )
            .bind(address)
            .bind(active)
            .bind(external_id)
            .execute(&self.pool)
            .await,
            "upsert project",
        )?;

        let project = self
            .get_project_by_address(address)
            .await?
            .ok_or_else(|| StoreError::ProjectNotFound(address.to_string()))?;
        debug!(address, project_id = project.id, "upserted project");
        Ok(project)
    }

    async fn get_project_by_address(&self, address: &str) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, address, external_id, active
              FROM project
             WHERE address = ?
            "#,
        )
        .bind(address.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_projects(&self, active_only: bool) -> Result<Vec<Project>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, address, external_id, active
              FROM project
             WHERE (? = 0 OR active = 1)
             ORDER BY id DESC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn set_project_active(&self, address: &str, active: bool) -> Result<u64, StoreError> {
        let result = logged(
            sqlx::query("UPDATE project SET active = ? WHERE address = ?")
                .bind(active)
                .bind(address.trim())
                .execute(&self.pool)
                .await,
            "set project active flag",
        )?;
        debug!(address, active, changes = result.rows_affected(), "set project active flag");
        Ok(result.rows_affected())
    }

    async fn set_external_id(&self, address: &str, external_id: i64) -> Result<Project, StoreError> {
        let address = normalize_address(address)?;
        let result = logged(
            sqlx::query("UPDATE project SET external_id = ? WHERE address = ?")
                .bind(external_id)
                .bind(address)
                .execute(&self.pool)
                .await,
            "back-fill external id",
        )?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ProjectNotFound(address.to_string()));
        }
        self.get_project_by_address(address)
            .await?
            .ok_or_else(|| StoreError::ProjectNotFound(address.to_string()))
    }

    async fn append_snapshot(&self, project_id: i64, metrics: &Metrics) -> Result<Snapshot, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let result = logged(
            sqlx::query(
                r#"
                INSERT INTO snapshot (
                    project_id,
                    captured_at,
                    estimate_builder_cost,
                    estimate_client_price,
                    job_cost,
                    invoice_total,
                    invoice_paid,
                    invoice_due,
                    change_order_builder_cost,
                    change_order_client_price
                )
                VALUES (
                    ?1,
                    MAX(?2, COALESCE((SELECT MAX(captured_at) FROM snapshot WHERE project_id = ?1), 0)),
                    ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
                )
                "#,
            )
            .bind(project_id)
            .bind(now_ms)
            .bind(metrics.estimate_builder_cost)
            .bind(metrics.estimate_client_price)
            .bind(metrics.job_cost)
            .bind(metrics.invoice_total)
            .bind(metrics.invoice_paid)
            .bind(metrics.invoice_due)
            .bind(metrics.change_order_builder_cost)
            .bind(metrics.change_order_client_price)
            .execute(&self.pool)
            .await,
            "append snapshot",
        )?;

        let snapshot = self.snapshot_by_id(result.last_insert_rowid()).await?;
        debug!(project_id, snapshot_id = snapshot.id, "appended snapshot");
        Ok(snapshot)
    }

    async fn get_latest_snapshot(&self, project_id: i64) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT *
              FROM snapshot
             WHERE project_id = ?
             ORDER BY captured_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(&self, project_id: i64, limit: Option<u32>) -> Result<Vec<Snapshot>, StoreError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM snapshot
             WHERE project_id = ?
             ORDER BY captured_at DESC, id DESC
             LIMIT ?
            "#,
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_metrics(job_cost: f64) -> Metrics {
        let mut metrics = Metrics {
            job_cost: Some(job_cost),
            invoice_total: Some(1000.0),
            invoice_paid: Some(400.0),
            ..Metrics::default()
        };
        metrics.derive_invoice_due();
        metrics
    }

    #[tokio::test]
    async fn upserting_same_address_keeps_one_row_with_stable_id() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let first = store.upsert_project("12 Elm St", true, None).await.unwrap();
        let second = store.upsert_project("12 Elm St", false, None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(!second.active);
        assert_eq!(store.list_projects(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn external_id_survives_upsert_without_one() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        store.create_project("4 Oak Ave", Some(42)).await.unwrap();
        let project = store.upsert_project("4 Oak Ave", true, None).await.unwrap();
        assert_eq!(project.external_id, Some(42));

        let project = store.upsert_project("4 Oak Ave", true, Some(7)).await.unwrap();
        assert_eq!(project.external_id, Some(7));
    }

    #[tokio::test]
    async fn blank_address_is_rejected() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let err = store.upsert_project("   ", true, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidAddress));
    }

    #[tokio::test]
    async fn latest_and_list_are_newest_first() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let project = store.upsert_project("9 Pine Rd", true, None).await.unwrap();

        let s1 = store.append_snapshot(project.id, &sample_metrics(1.0)).await.unwrap();
        let s2 = store.append_snapshot(project.id, &sample_metrics(2.0)).await.unwrap();
        assert!(s2.captured_at >= s1.captured_at);

        let latest = store.get_latest_snapshot(project.id).await.unwrap().unwrap();
        assert_eq!(latest.id, s2.id);

        let ids = store
            .list_snapshots(project.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![s2.id, s1.id]);

        let limited = store.list_snapshots(project.id, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, s2.id);
    }

    #[tokio::test]
    async fn snapshot_round_trips_absent_metrics() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let project = store.upsert_project("1 Empty Ct", true, None).await.unwrap();
        let snapshot = store.append_snapshot(project.id, &Metrics::default()).await.unwrap();

        assert!(snapshot.metrics.is_empty());
        assert_eq!(snapshot.project_id, project.id);
    }

    #[tokio::test]
    async fn active_toggle_filters_listing() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        store.upsert_project("A St", true, None).await.unwrap();
        store.upsert_project("B St", true, None).await.unwrap();

        assert_eq!(store.set_project_active("B St", false).await.unwrap(), 1);
        assert_eq!(store.set_project_active("Nowhere", false).await.unwrap(), 0);

        let active = store.list_projects(true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, "A St");
    }

    #[tokio::test]
    async fn external_id_backfill_requires_existing_project() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let err = store.set_external_id("Ghost Ln", 5).await.unwrap_err();
        assert!(matches!(err, StoreError::ProjectNotFound(_)));

        store.upsert_project("Real Ln", true, None).await.unwrap();
        let project = store.set_external_id("Real Ln", 5).await.unwrap();
        assert_eq!(project.external_id, Some(5));
    }

    #[tokio::test]
    async fn on_disk_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("jobsnap.db");

        let store = SqliteStore::open(&path).await.expect("open");
        let project = store.upsert_project("77 Bay St", true, None).await.unwrap();
        store.append_snapshot(project.id, &sample_metrics(3.0)).await.unwrap();
        store.pool().close().await;

        let reopened = SqliteStore::open(&path).await.expect("reopen");
        let (project, latest) = reopened.latest_for_address("77 Bay St").await.unwrap().unwrap();
        assert_eq!(project.address, "77 Bay St");
        assert_eq!(latest.unwrap().metrics.invoice_due, Some(600.0));
    }
}
