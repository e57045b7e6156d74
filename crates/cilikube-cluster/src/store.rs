//! Credential store: durable CRUD over cluster records
//!
//! The SQL store speaks to SQLite or MySQL through the sqlx `Any` driver so a
//! single query set serves both. Timestamps are stored as unix seconds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::record::{ClusterRecord, ClusterSource};

/// Credential store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Another record already uses this name
    #[error("cluster name already exists: {0}")]
    NameConflict(String),

    /// No record with this id
    #[error("cluster record not found: {0}")]
    NotFound(String),

    /// Record rejected before reaching storage
    #[error("invalid cluster record: {0}")]
    Invalid(String),
}

impl From<StoreError> for cilikube_common::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NameConflict(name) => {
                Self::Conflict(format!("cluster name already exists: {}", name))
            }
            StoreError::NotFound(id) => Self::ClusterNotFound(id),
            StoreError::Invalid(msg) => Self::Validation(msg),
            StoreError::Database(e) => Self::Storage(e.to_string()),
        }
    }
}

/// Durable storage for database-sourced cluster records
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Insert a record; assigns a fresh id when the record's id is empty
    async fn create(&self, record: ClusterRecord) -> Result<ClusterRecord, StoreError>;

    /// Fetch a record by id
    async fn get(&self, id: &str) -> Result<Option<ClusterRecord>, StoreError>;

    /// All records in creation order
    async fn list_all(&self) -> Result<Vec<ClusterRecord>, StoreError>;

    /// Replace the mutable fields of an existing record
    async fn update(&self, record: ClusterRecord) -> Result<ClusterRecord, StoreError>;

    /// Delete a record by id
    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;

    /// Record the last discovered server version
    async fn update_version(&self, id: &str, version: &str) -> Result<(), StoreError>;
}

fn prepare_new(mut record: ClusterRecord) -> Result<ClusterRecord, StoreError> {
    if record.name.trim().is_empty() {
        return Err(StoreError::Invalid("cluster name must not be empty".into()));
    }
    if record.id.is_empty() {
        record.id = uuid::Uuid::new_v4().to_string();
    }
    let now = Utc::now();
    record.created_at = now;
    record.updated_at = now;
    record.source = ClusterSource::Database;
    record.config_path = None;
    Ok(record)
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS clusters (
    id VARCHAR(64) NOT NULL PRIMARY KEY,
    name VARCHAR(255) NOT NULL UNIQUE,
    kubeconfig LONGBLOB,
    environment VARCHAR(64) NOT NULL DEFAULT '',
    provider VARCHAR(64) NOT NULL DEFAULT '',
    description TEXT,
    region VARCHAR(64) NOT NULL DEFAULT '',
    version VARCHAR(64) NOT NULL DEFAULT '',
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)";

const SELECT_COLUMNS: &str = "SELECT id, name, kubeconfig, environment, provider, description, \
     region, version, created_at, updated_at FROM clusters";

/// sqlx-backed store for SQLite and MySQL
#[derive(Clone)]
pub struct SqlClusterStore {
    pool: AnyPool,
}

impl SqlClusterStore {
    /// Connect to `url` and create the schema if absent
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("cluster store ready");
        Ok(store)
    }

    /// Wrap an existing pool without touching the schema
    pub fn from_pool(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Create the `clusters` table if it does not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    async fn name_taken(&self, name: &str, except_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM clusters WHERE name = ? AND id <> ?")
            .bind(name)
            .bind(except_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(count > 0)
    }

    fn record_from_row(row: &AnyRow) -> Result<ClusterRecord, StoreError> {
        let description: Option<String> = row.try_get("description")?;
        Ok(ClusterRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kubeconfig: row.try_get("kubeconfig")?,
            config_path: None,
            source: ClusterSource::Database,
            environment: row.try_get("environment")?,
            provider: row.try_get("provider")?,
            description: description.unwrap_or_default(),
            region: row.try_get("region")?,
            version: row.try_get("version")?,
            created_at: from_unix(row.try_get("created_at")?),
            updated_at: from_unix(row.try_get("updated_at")?),
        })
    }
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl ClusterStore for SqlClusterStore {
    async fn create(&self, record: ClusterRecord) -> Result<ClusterRecord, StoreError> {
        let record = prepare_new(record)?;
        if self.name_taken(&record.name, &record.id).await? {
            return Err(StoreError::NameConflict(record.name));
        }
        sqlx::query(
            "INSERT INTO clusters (id, name, kubeconfig, environment, provider, description, \
             region, version, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.kubeconfig.clone())
        .bind(&record.environment)
        .bind(&record.provider)
        .bind(&record.description)
        .bind(&record.region)
        .bind(&record.version)
        .bind(record.created_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                StoreError::NameConflict(record.name.clone())
            } else {
                StoreError::Database(e)
            }
        })?;
        debug!(cluster = %record.id, name = %record.name, "cluster record created");
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn list_all(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at, id", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn update(&self, mut record: ClusterRecord) -> Result<ClusterRecord, StoreError> {
        if record.name.trim().is_empty() {
            return Err(StoreError::Invalid("cluster name must not be empty".into()));
        }
        if self.name_taken(&record.name, &record.id).await? {
            return Err(StoreError::NameConflict(record.name));
        }
        record.updated_at = Utc::now();
        let result = sqlx::query(
            "UPDATE clusters SET name = ?, kubeconfig = ?, environment = ?, provider = ?, \
             description = ?, region = ?, version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&record.name)
        .bind(record.kubeconfig.clone())
        .bind(&record.environment)
        .bind(&record.provider)
        .bind(&record.description)
        .bind(&record.region)
        .bind(&record.version)
        .bind(record.updated_at.timestamp())
        .bind(&record.id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                StoreError::NameConflict(record.name.clone())
            } else {
                StoreError::Database(e)
            }
        })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.id));
        }
        Ok(record)
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_version(&self, id: &str, version: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE clusters SET version = ?, updated_at = ? WHERE id = ?")
            .bind(version)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local store used when persistence is disabled
#[derive(Clone, Default)]
pub struct MemoryClusterStore {
    records: Arc<RwLock<Vec<ClusterRecord>>>,
}

impl MemoryClusterStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn create(&self, record: ClusterRecord) -> Result<ClusterRecord, StoreError> {
        let record = prepare_new(record)?;
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.name == record.name) {
            return Err(StoreError::NameConflict(record.name));
        }
        records.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        Ok(self.records.read().await.clone())
    }

    async fn update(&self, mut record: ClusterRecord) -> Result<ClusterRecord, StoreError> {
        if record.name.trim().is_empty() {
            return Err(StoreError::Invalid("cluster name must not be empty".into()));
        }
        let mut records = self.records.write().await;
        if records
            .iter()
            .any(|r| r.name == record.name && r.id != record.id)
        {
            return Err(StoreError::NameConflict(record.name));
        }
        let slot = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        record.created_at = slot.created_at;
        record.updated_at = Utc::now();
        *slot = record.clone();
        Ok(record)
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_version(&self, id: &str, version: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            record.version = version.to_string();
            record.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_store() -> SqlClusterStore {
        // A single connection keeps every query on the same in-memory database
        SqlClusterStore::connect("sqlite::memory:", 1)
            .await
            .expect("in-memory sqlite should open")
    }

    async fn exercise_crud(store: &dyn ClusterStore) {
        let mut rec = ClusterRecord::new("prod", b"apiVersion: v1".to_vec());
        rec.environment = "production".into();
        let created = store.create(rec).await.unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(created.source, ClusterSource::Database);

        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "prod");
        assert_eq!(fetched.environment, "production");
        assert_eq!(fetched.kubeconfig.as_deref(), Some(&b"apiVersion: v1"[..]));

        let dup = store
            .create(ClusterRecord::new("prod", b"x".to_vec()))
            .await;
        assert!(matches!(dup, Err(StoreError::NameConflict(n)) if n == "prod"));

        let staging = store
            .create(ClusterRecord::new("staging", b"y".to_vec()))
            .await
            .unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);

        let mut renamed = staging.clone();
        renamed.name = "prod".into();
        assert!(matches!(
            store.update(renamed).await,
            Err(StoreError::NameConflict(_))
        ));

        let mut changed = staging.clone();
        changed.region = "eu-west-1".into();
        store.update(changed).await.unwrap();
        assert_eq!(
            store.get(&staging.id).await.unwrap().unwrap().region,
            "eu-west-1"
        );

        store.update_version(&created.id, "v1.32.1").await.unwrap();
        assert_eq!(
            store.get(&created.id).await.unwrap().unwrap().version,
            "v1.32.1"
        );

        store.delete_by_id(&created.id).await.unwrap();
        assert!(store.get(&created.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_by_id(&created.id).await,
            Err(StoreError::NotFound(_))
        ));

        let mut ghost = staging.clone();
        ghost.id = "missing".into();
        ghost.name = "ghost".into();
        assert!(matches!(
            store.update(ghost).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_crud() {
        exercise_crud(&MemoryClusterStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_crud() {
        exercise_crud(&sqlite_store().await).await;
    }

    #[tokio::test]
    async fn explicit_ids_are_kept() {
        let store = MemoryClusterStore::new();
        let mut rec = ClusterRecord::new("lab", b"k".to_vec());
        rec.id = "lab-1".into();
        let created = store.create(rec).await.unwrap();
        assert_eq!(created.id, "lab-1");
    }

    #[tokio::test]
    async fn empty_names_are_rejected() {
        let store = MemoryClusterStore::new();
        let err = store
            .create(ClusterRecord::new("  ", b"k".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(
            cilikube_common::Error::from(err),
            cilikube_common::Error::Validation(_)
        ));
    }

    #[test]
    fn store_errors_map_to_domain_errors() {
        use cilikube_common::Error;
        assert!(matches!(
            Error::from(StoreError::NameConflict("a".into())),
            Error::Conflict(_)
        ));
        assert!(matches!(
            Error::from(StoreError::NotFound("a".into())),
            Error::ClusterNotFound(id) if id == "a"
        ));
    }
}
