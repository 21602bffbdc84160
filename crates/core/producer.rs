//! Producer for enqueueing jobs.

use std::time::Duration;

use crate::backend::{Backend, SharedBackend};
use crate::envelope::{now_millis, EntryId, Envelope, JobId};
use crate::error::Result;
use crate::keys::QueueKeys;

/// Appends first-attempt envelopes to the live log.
///
/// Append failures are returned to the caller as-is; the producer never
/// retries on its own.
#[derive(Clone)]
pub struct Producer<B: Backend + Clone = SharedBackend> {
    backend: B,
    keys: QueueKeys,
}

impl Producer<SharedBackend> {
    /// Create a new producer with a shared backend.
    pub fn new(backend: impl Backend + 'static, queue: impl Into<String>) -> Self {
        Self {
            backend: SharedBackend::new(backend),
            keys: QueueKeys::new(queue),
        }
    }
}

impl<B: Backend + Clone> Producer<B> {
    /// Create a new producer with a specific backend.
    pub fn with_backend(backend: B, keys: QueueKeys) -> Self {
        Self { backend, keys }
    }

    /// Queue names this producer writes to.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Enqueue a job for immediate processing.
    pub async fn enqueue(
        &self,
        job_id: JobId,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<EntryId> {
        let envelope = Envelope::new(job_id, job_type, payload);
        let entry_id = self
            .backend
            .append(self.keys.queue(), &envelope.encode()?)
            .await?;

        tracing::debug!(
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            entry_id = %entry_id,
            queue = %self.keys.queue(),
            "Job enqueued"
        );
        Ok(entry_id)
    }

    /// Enqueue a job that becomes eligible after `delay`.
    ///
    /// The envelope waits in the delay index and is promoted by the scheduler
    /// like any retry.
    pub async fn enqueue_in(
        &self,
        job_id: JobId,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<i64> {
        let envelope = Envelope::new(job_id, job_type, payload);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let ready_at = now_millis().saturating_add(delay_ms);
        self.backend
            .schedule(&self.keys.delayed(), ready_at, &envelope.encode()?)
            .await?;

        tracing::debug!(job_id = %envelope.job_id, ready_at = ready_at, "Job scheduled");
        Ok(ready_at)
    }

    /// Number of entries in the live log.
    pub async fn queue_len(&self) -> Result<usize> {
        self.backend.len(self.keys.queue()).await
    }

    /// Number of envelopes waiting in the delay index.
    pub async fn delayed_len(&self) -> Result<usize> {
        self.backend.delayed_len(&self.keys.delayed()).await
    }

    /// Number of dead-lettered jobs.
    pub async fn dead_len(&self) -> Result<usize> {
        self.backend.dead_len(&self.keys.dead()).await
    }
}
