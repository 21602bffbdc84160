//! PostgreSQL Job Record store for jobq.
//!
//! Keeps one row per job in a `jobs` table. The queue itself lives in the
//! broker; this table only mirrors status for the HTTP API.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jobq_core::{JobId, JobRecordStore, JobStatus};
//! use jobq_postgres::PgJobStore;
//!
//! #[tokio::main]
//! async fn main() -> jobq_core::Result<()> {
//!     let store = PgJobStore::new("postgres://localhost/mydb").await?;
//!     store.insert(&JobId::new(), JobStatus::Pending, &serde_json::json!({})).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use jobq_core::{EntryId, JobId, JobRecord, JobRecordStore, JobStatus, JobUpdate, JobqError, Result};

/// Default table name.
pub const DEFAULT_TABLE: &str = "jobs";

type JobRow = (
    Uuid,
    Option<String>,
    String,
    Option<serde_json::Value>,
    Option<serde_json::Value>,
    DateTime<Utc>,
    DateTime<Utc>,
);

/// PostgreSQL-backed [`JobRecordStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    table: String,
}

impl PgJobStore {
    /// Connect and create the `jobs` table if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| JobqError::RecordStore(format!("Failed to connect to PostgreSQL: {}", e)))?;

        let store = Self::with_pool(pool, DEFAULT_TABLE)?;
        store.init_tables().await?;
        Ok(store)
    }

    /// Use an existing pool and table. Tables are not created.
    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the jobs table.
    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                redis_id VARCHAR(255),
                status VARCHAR(50) NOT NULL DEFAULT 'PENDING',
                payload JSONB,
                result JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| JobqError::RecordStore(format!("Failed to create jobs table: {}", e)))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_status ON {} (status)",
            self.table, self.table
        ))
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Table names are interpolated into SQL, so only plain identifiers are allowed.
fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(JobqError::Config(format!("invalid table name: {:?}", table)))
    }
}

fn record_from_row(row: JobRow) -> Result<JobRecord> {
    let (id, redis_id, status, payload, result, created_at, updated_at) = row;
    Ok(JobRecord {
        id: JobId(id),
        entry_id: redis_id.map(EntryId),
        status: status.parse()?,
        payload: payload.unwrap_or(serde_json::Value::Null),
        result,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl JobRecordStore for PgJobStore {
    async fn insert(&self, id: &JobId, status: JobStatus, payload: &serde_json::Value) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, status, payload) VALUES ($1, $2, $3)",
            self.table
        ))
        .bind(id.0)
        .bind(status.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| JobqError::RecordStore(format!("Failed to insert job: {}", e)))?;
        Ok(())
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = COALESCE($2, status),
                result = COALESCE($3, result),
                redis_id = COALESCE($4, redis_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
            self.table
        ))
        .bind(id.0)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.result)
        .bind(update.entry_id.map(|e| e.0))
        .execute(&self.pool)
        .await
        .map_err(|e| JobqError::RecordStore(format!("Failed to update job: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(JobqError::JobNotFound(id.to_string()));
        }
        tracing::trace!(job_id = %id, "Job record updated");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT id, redis_id, status, payload, result, created_at, updated_at
            FROM {} WHERE id = $1
            "#,
            self.table
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| JobqError::RecordStore(format!("Failed to get job: {}", e)))?;

        row.map(record_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("jobs").is_ok());
        assert!(validate_table_name("_jobq_jobs_v2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2jobs").is_err());
        assert!(validate_table_name("jobs; DROP TABLE users").is_err());
        assert!(validate_table_name("public.jobs").is_err());
    }

    #[test]
    fn test_record_from_row() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = record_from_row((
            id,
            Some("1700000000000-0".to_string()),
            "COMPLETED".to_string(),
            Some(serde_json::json!({"to": "a@b.com"})),
            None,
            now,
            now,
        ))
        .unwrap();

        assert_eq!(record.id, JobId(id));
        assert_eq!(record.entry_id, Some(EntryId::from("1700000000000-0")));
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.result.is_none());
    }

    #[test]
    fn test_record_from_row_rejects_unknown_status() {
        let now = Utc::now();
        let row = (Uuid::new_v4(), None, "LOST".to_string(), None, None, now, now);
        assert!(record_from_row(row).is_err());
    }
}

// ========== Integration Tests (require PostgreSQL) ==========
