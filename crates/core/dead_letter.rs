//! Dead-letter sink: terminal, append-only store for exhausted jobs.

use crate::backend::DeadLetterLog;
use crate::envelope::{DeadLetter, EntryId, Envelope};
use crate::error::Result;

/// Records jobs that will never be attempted again.
#[derive(Clone)]
pub struct DeadLetterSink<B: DeadLetterLog> {
    backend: B,
    dlq: String,
}

impl<B: DeadLetterLog> DeadLetterSink<B> {
    /// Create a sink writing to the dead-letter log named `dlq`.
    pub fn new(backend: B, dlq: impl Into<String>) -> Self {
        Self {
            backend,
            dlq: dlq.into(),
        }
    }

    /// Append an exhausted envelope with its failure time and final error.
    pub async fn record(&self, envelope: Envelope, failed_at: i64, error: &str) -> Result<EntryId> {
        self.record_letter(&DeadLetter {
            envelope,
            failed_at,
            error: error.to_string(),
        })
        .await
    }

    /// Append a prepared dead letter.
    pub async fn record_letter(&self, letter: &DeadLetter) -> Result<EntryId> {
        let id = self.backend.append_dead(&self.dlq, &letter.encode()?).await?;
        tracing::warn!(
            job_id = %letter.envelope.job_id,
            retry_count = letter.envelope.retry_count,
            error = %letter.error,
            "Job moved to dead-letter log"
        );
        Ok(id)
    }

    /// Append a log entry whose envelope could not be decoded.
    pub async fn record_malformed(&self, raw: &str, error: &str, failed_at: i64) -> Result<EntryId> {
        let record = serde_json::json!({
            "raw": raw,
            "error": error,
            "failedAt": failed_at,
        });
        self.backend.append_dead(&self.dlq, &record.to_string()).await
    }

    /// List dead letters in append order. Entries that are not dead letters
    /// (malformed raw records) are skipped.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetter>> {
        let raw = self.backend.list_dead(&self.dlq, limit, offset).await?;
        Ok(raw
            .iter()
            .filter_map(|json| DeadLetter::decode(json).ok())
            .collect())
    }

    /// Number of records in the dead-letter log.
    pub async fn len(&self) -> Result<usize> {
        self.backend.dead_len(&self.dlq).await
    }

    /// Whether the dead-letter log is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
