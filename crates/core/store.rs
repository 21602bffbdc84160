//! Job Record store: the relational mirror of a job's lifecycle.
//!
//! The queue engine never reads these records. They are written by the API on
//! submission and by [`RecordTracking`] around each handler run, and can drift
//! from the log after a crash between an ack and the matching update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::engine::{JobHandler, JobResult};
use crate::envelope::{EntryId, Envelope, JobId};
use crate::error::{JobqError, Result};

/// The status of a Job Record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, not yet picked up.
    Pending,
    /// A handler is running an attempt.
    Processing,
    /// Last attempt succeeded.
    Completed,
    /// Last attempt failed. A retry may still follow.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(JobqError::RecordStore(format!("unknown job status: {}", other))),
        }
    }
}

/// Durable, user-visible record of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Log entry id of the first attempt, recorded after enqueue.
    pub entry_id: Option<EntryId>,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields to change on a Job Record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub result: Option<serde_json::Value>,
    pub entry_id: Option<EntryId>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn entry_id(entry_id: EntryId) -> Self {
        Self {
            entry_id: Some(entry_id),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Storage for Job Records. Writes are last-writer-wins.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, id: &JobId, status: JobStatus, payload: &serde_json::Value) -> Result<()>;

    /// Apply `update` and bump `updated_at`. Fails with `JobNotFound` if no record matches.
    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<()>;

    /// Fetch a record by id.
    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;
}

#[async_trait]
impl<T: JobRecordStore + ?Sized> JobRecordStore for Arc<T> {
    async fn insert(&self, id: &JobId, status: JobStatus, payload: &serde_json::Value) -> Result<()> {
        (**self).insert(id, status, payload).await
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<()> {
        (**self).update(id, update).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        (**self).get(id).await
    }
}

/// In-memory record store.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<Mutex<HashMap<JobId, JobRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, JobRecord>>> {
        self.records
            .lock()
            .map_err(|_| JobqError::RecordStore("record store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobRecordStore for MemoryRecordStore {
    async fn insert(&self, id: &JobId, status: JobStatus, payload: &serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let mut records = self.lock()?;
        if records.contains_key(id) {
            return Err(JobqError::RecordStore(format!("duplicate job id: {}", id)));
        }
        records.insert(
            id.clone(),
            JobRecord {
                id: id.clone(),
                entry_id: None,
                status,
                payload: payload.clone(),
                result: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<()> {
        let mut records = self.lock()?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| JobqError::JobNotFound(id.to_string()))?;
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(result) = update.result {
            record.result = Some(result);
        }
        if let Some(entry_id) = update.entry_id {
            record.entry_id = Some(entry_id);
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.lock()?.get(id).cloned())
    }
}

/// Handler wrapper that mirrors each attempt into the Job Record store.
///
/// Marks the record PROCESSING before the inner handler runs, then COMPLETED
/// with `{success, processedBy}` or FAILED with `{error}`. Store failures are
/// logged and never change the handler's result.
pub struct RecordTracking<S, H> {
    store: S,
    inner: H,
    worker_id: String,
}

impl<S: JobRecordStore, H: JobHandler> RecordTracking<S, H> {
    pub fn new(store: S, inner: H, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            inner,
            worker_id: worker_id.into(),
        }
    }

    async fn record(&self, job_id: &JobId, update: JobUpdate) {
        let status = update.status;
        if let Err(e) = self.store.update(job_id, update).await {
            tracing::error!(
                job_id = %job_id,
                status = ?status,
                error = %e,
                "Failed to update job record"
            );
        }
    }
}

#[async_trait]
impl<S, H> JobHandler for RecordTracking<S, H>
where
    S: JobRecordStore + 'static,
    H: JobHandler,
{
    async fn handle(&self, entry_id: &EntryId, envelope: &Envelope) -> JobResult {
        let job_id = &envelope.job_id;
        self.record(job_id, JobUpdate::status(JobStatus::Processing))
            .await;

        let result = self.inner.handle(entry_id, envelope).await;

        match &result {
            Ok(()) => {
                let update = JobUpdate::status(JobStatus::Completed).with_result(serde_json::json!({
                    "success": true,
                    "processedBy": self.worker_id,
                }));
                self.record(job_id, update).await;
            }
            Err(err) => {
                let update = JobUpdate::status(JobStatus::Failed)
                    .with_result(serde_json::json!({ "error": err.message }));
                self.record(job_id, update).await;
            }
        }
        result
    }
}
