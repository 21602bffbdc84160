//! Consumer group engine: claims entries one at a time, runs the handler and
//! routes the result.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::dead_letter::DeadLetterSink;
use crate::envelope::{now_millis, EntryId, Envelope};
use crate::error::Result;
use crate::keys::QueueKeys;
use crate::retry::{RetryDecision, RetryPolicy};

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from job handlers.
///
/// Every handler error goes through the retry policy; there is no way to skip
/// straight to the dead-letter log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    /// Error message, stored as the envelope's `lastError`.
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// Business logic invoked for every claimed entry.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, entry_id: &EntryId, envelope: &Envelope) -> JobResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(EntryId, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, entry_id: &EntryId, envelope: &Envelope) -> JobResult {
        (self)(entry_id.clone(), envelope.clone()).await
    }
}

/// What happened to a processed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded; entry acknowledged.
    Completed,
    /// Handler failed; a new envelope waits in the delay index.
    Retrying { retry_count: u32, ready_at: i64 },
    /// Handler failed with no retries left.
    DeadLettered,
    /// Entry could not be decoded; raw bytes dead-lettered.
    Malformed,
}

/// Drives a single consumer identity against one consumer group.
pub struct ConsumerEngine<B: Backend + Clone, H: JobHandler> {
    backend: B,
    keys: QueueKeys,
    group: String,
    consumer: String,
    handler: Arc<H>,
    policy: RetryPolicy,
    dead: DeadLetterSink<B>,
    fetch_timeout: Duration,
    error_backoff: Duration,
}

impl<B: Backend + Clone, H: JobHandler> ConsumerEngine<B, H> {
    /// Create an engine with the default retry policy, a 5s read timeout and a
    /// 1s error backoff.
    pub fn new(
        backend: B,
        keys: QueueKeys,
        group: impl Into<String>,
        consumer: impl Into<String>,
        handler: Arc<H>,
    ) -> Self {
        let dead = DeadLetterSink::new(backend.clone(), keys.dead());
        Self {
            backend,
            keys,
            group: group.into(),
            consumer: consumer.into(),
            handler,
            policy: RetryPolicy::default(),
            dead,
            fetch_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upper bound on a single blocking read.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Pause after an engine-level error before reading again.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Run until `cancel` fires.
    ///
    /// Fails only if the consumer group cannot be ensured at startup. A read
    /// already in progress when `cancel` fires is allowed to finish, so an
    /// entry it claims is still processed rather than stranded in the pending
    /// set.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.backend
            .ensure_group(self.keys.queue(), &self.group)
            .await?;

        tracing::info!(
            consumer = %self.consumer,
            group = %self.group,
            queue = %self.keys.queue(),
            "Consumer started"
        );

        while !cancel.is_cancelled() {
            if let Err(e) = self.poll(&cancel).await {
                tracing::error!(consumer = %self.consumer, error = %e, "Consumer error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.error_backoff) => {}
                }
            }
        }

        tracing::info!(consumer = %self.consumer, "Consumer stopped");
        Ok(())
    }

    /// Claim and process at most one entry. Returns `None` if the read timed out.
    pub async fn poll_once(&self) -> Result<Option<Outcome>> {
        self.poll(&CancellationToken::new()).await
    }

    async fn poll(&self, cancel: &CancellationToken) -> Result<Option<Outcome>> {
        let claimed = self
            .backend
            .read_next(
                self.keys.queue(),
                &self.group,
                &self.consumer,
                self.fetch_timeout,
            )
            .await?;

        match claimed {
            Some((entry_id, raw)) => self.process(&entry_id, &raw, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one claimed entry: run the handler, acknowledge, route failures.
    ///
    /// Once a failed entry is acknowledged, a transient error while handing
    /// it to the delay index or dead-letter log is retried every
    /// `error_backoff` until the handoff lands.
    pub async fn process_entry(&self, entry_id: &EntryId, raw: &str) -> Result<Outcome> {
        self.process(entry_id, raw, &CancellationToken::new()).await
    }

    async fn process(&self, entry_id: &EntryId, raw: &str, cancel: &CancellationToken) -> Result<Outcome> {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    entry_id = %entry_id,
                    error = %e,
                    "Failed to decode envelope, moving to dead-letter log"
                );
                self.dead
                    .record_malformed(raw, &e.to_string(), now_millis())
                    .await?;
                self.ack(entry_id).await?;
                return Ok(Outcome::Malformed);
            }
        };

        tracing::debug!(
            consumer = %self.consumer,
            entry_id = %entry_id,
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            attempt = envelope.attempt(),
            "Processing job"
        );

        match self.handler.handle(entry_id, &envelope).await {
            Ok(()) => {
                self.ack(entry_id).await?;
                tracing::debug!(job_id = %envelope.job_id, entry_id = %entry_id, "Job completed");
                Ok(Outcome::Completed)
            }
            Err(err) => {
                // Retries travel as new entries, never as log redelivery.
                self.ack(entry_id).await?;
                self.hand_off(&envelope, &err, cancel).await
            }
        }
    }

    // The entry is already acked, so this envelope is the only copy left.
    async fn hand_off(
        &self,
        envelope: &Envelope,
        err: &JobError,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        loop {
            match self.on_failure(envelope, err).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && !cancel.is_cancelled() => {
                    tracing::error!(
                        consumer = %self.consumer,
                        job_id = %envelope.job_id,
                        retry_count = envelope.retry_count,
                        error = %e,
                        "Failed to route failed job, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(
                        consumer = %self.consumer,
                        job_id = %envelope.job_id,
                        job_type = %envelope.job_type,
                        retry_count = envelope.retry_count,
                        payload = %envelope.payload,
                        error = %e,
                        "Failed job could not be routed and was dropped"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn on_failure(&self, envelope: &Envelope, err: &JobError) -> Result<Outcome> {
        match self.policy.on_failure(envelope, &err.message, now_millis()) {
            RetryDecision::Scheduled(entry) => {
                self.backend
                    .schedule(&self.keys.delayed(), entry.ready_at, &entry.envelope.encode()?)
                    .await?;
                tracing::warn!(
                    job_id = %envelope.job_id,
                    retry_count = entry.envelope.retry_count,
                    ready_at = entry.ready_at,
                    error = %err.message,
                    "Job failed, scheduled for retry"
                );
                Ok(Outcome::Retrying {
                    retry_count: entry.envelope.retry_count,
                    ready_at: entry.ready_at,
                })
            }
            RetryDecision::Exhausted(letter) => {
                self.dead.record_letter(&letter).await?;
                Ok(Outcome::DeadLettered)
            }
        }
    }

    async fn ack(&self, entry_id: &EntryId) -> Result<()> {
        self.backend
            .ack(self.keys.queue(), &self.group, entry_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeadLetterLog, DelayIndex, LogStore};
    use crate::envelope::{DeadLetter, JobId};
    use crate::error::JobqError;
    use crate::memory::MemoryBackend;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GROUP: &str = "workers_group";

    fn keys() -> QueueKeys {
        QueueKeys::default()
    }

    async fn enqueue(backend: &MemoryBackend, envelope: &Envelope) -> EntryId {
        backend
            .append(keys().queue(), &envelope.encode().unwrap())
            .await
            .unwrap()
    }

    fn engine<H: JobHandler>(backend: &MemoryBackend, handler: H) -> ConsumerEngine<MemoryBackend, H> {
        ConsumerEngine::new(backend.clone(), keys(), GROUP, "worker-1", Arc::new(handler))
            .fetch_timeout(Duration::from_millis(20))
    }

    async fn always_ok(_: EntryId, _: Envelope) -> JobResult {
        Ok(())
    }

    async fn always_fail(_: EntryId, _: Envelope) -> JobResult {
        Err(JobError::new("smtp timeout"))
    }

    /// Memory backend whose reads and schedules fail a set number of times.
    #[derive(Clone)]
    struct Flaky {
        inner: MemoryBackend,
        read_failures: Arc<AtomicUsize>,
        schedule_failures: Arc<AtomicUsize>,
    }

    impl Flaky {
        fn new(read_failures: usize, schedule_failures: usize) -> Self {
            Self {
                inner: MemoryBackend::new(),
                read_failures: Arc::new(AtomicUsize::new(read_failures)),
                schedule_failures: Arc::new(AtomicUsize::new(schedule_failures)),
            }
        }

        fn engine<H: JobHandler>(&self, handler: H) -> ConsumerEngine<Flaky, H> {
            ConsumerEngine::new(self.clone(), keys(), GROUP, "worker-1", Arc::new(handler))
                .fetch_timeout(Duration::from_millis(20))
                .error_backoff(Duration::from_millis(10))
        }
    }

    fn take(remaining: &AtomicUsize) -> bool {
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl LogStore for Flaky {
        async fn append(&self, queue: &str, envelope_json: &str) -> Result<EntryId> {
            self.inner.append(queue, envelope_json).await
        }

        async fn ensure_group(&self, queue: &str, group: &str) -> Result<()> {
            self.inner.ensure_group(queue, group).await
        }

        async fn read_next(
            &self,
            queue: &str,
            group: &str,
            consumer: &str,
            timeout: Duration,
        ) -> Result<Option<(EntryId, String)>> {
            if take(&self.read_failures) {
                return Err(JobqError::Backend("connection reset".to_string()));
            }
            self.inner.read_next(queue, group, consumer, timeout).await
        }

        async fn ack(&self, queue: &str, group: &str, entry_id: &EntryId) -> Result<()> {
            self.inner.ack(queue, group, entry_id).await
        }

        async fn len(&self, queue: &str) -> Result<usize> {
            self.inner.len(queue).await
        }
    }

    #[async_trait]
    impl DelayIndex for Flaky {
        async fn schedule(&self, index: &str, ready_at: i64, envelope_json: &str) -> Result<()> {
            if take(&self.schedule_failures) {
                return Err(JobqError::Backend("connection reset".to_string()));
            }
            self.inner.schedule(index, ready_at, envelope_json).await
        }

        async fn pop_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>> {
            self.inner.pop_due(index, now, limit).await
        }

        async fn peek_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>> {
            self.inner.peek_due(index, now, limit).await
        }

        async fn remove(&self, index: &str, envelope_json: &str) -> Result<bool> {
            self.inner.remove(index, envelope_json).await
        }

        async fn delayed_len(&self, index: &str) -> Result<usize> {
            self.inner.delayed_len(index).await
        }
    }

    #[async_trait]
    impl DeadLetterLog for Flaky {
        async fn append_dead(&self, dlq: &str, record_json: &str) -> Result<EntryId> {
            self.inner.append_dead(dlq, record_json).await
        }

        async fn dead_len(&self, dlq: &str) -> Result<usize> {
            self.inner.dead_len(dlq).await
        }

        async fn list_dead(&self, dlq: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
            self.inner.list_dead(dlq, limit, offset).await
        }
    }

    impl Backend for Flaky {}

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_job_error_from_std_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: JobError = io.into();
        assert_eq!(err.message, "disk full");
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_success_acks_once() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, always_ok);
        backend.ensure_group(keys().queue(), GROUP).await.unwrap();
        let env = Envelope::new(JobId::new(), "email", json!({"to": "a@b.com"}));
        let entry_id = enqueue(&backend, &env).await;

        let outcome = engine.poll_once().await.unwrap();

        assert_eq!(outcome, Some(Outcome::Completed));
        assert_eq!(backend.acked(keys().queue(), GROUP), vec![entry_id]);
        assert!(backend.pending(keys().queue(), GROUP).is_empty());
        assert_eq!(backend.delayed_len(&keys().delayed()).await.unwrap(), 0);
        assert_eq!(backend.dead_len(&keys().dead()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poll_times_out_without_entries() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, always_ok);
        backend.ensure_group(keys().queue(), GROUP).await.unwrap();

        assert_eq!(engine.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_acks_then_schedules_retry() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, always_fail);
        backend.ensure_group(keys().queue(), GROUP).await.unwrap();
        let env = Envelope::new(JobId::new(), "email", json!({}));
        let entry_id = enqueue(&backend, &env).await;
        let before = now_millis();

        let outcome = engine.poll_once().await.unwrap().unwrap();

        match outcome {
            Outcome::Retrying {
                retry_count,
                ready_at,
            } => {
                assert_eq!(retry_count, 1);
                assert!(ready_at >= before + 2000);
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(backend.acked(keys().queue(), GROUP), vec![entry_id]);

        let delayed = backend.delayed(&keys().delayed());
        assert_eq!(delayed.len(), 1);
        let retry = Envelope::decode(&delayed[0].1).unwrap();
        assert_eq!(retry.job_id, env.job_id);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.last_error.as_deref(), Some("smtp timeout"));
    }

    #[tokio::test]
    async fn test_exhausted_job_is_dead_lettered() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, always_fail);
        backend.ensure_group(keys().queue(), GROUP).await.unwrap();
        let env = Envelope {
            retry_count: 3,
            ..Envelope::new(JobId::new(), "email", json!({}))
        };
        enqueue(&backend, &env).await;

        let outcome = engine.poll_once().await.unwrap();

        assert_eq!(outcome, Some(Outcome::DeadLettered));
        assert_eq!(backend.delayed_len(&keys().delayed()).await.unwrap(), 0);
        let dead = backend.list_dead(&keys().dead(), 10, 0).await.unwrap();
        assert_eq!(dead.len(), 1);
        let letter = DeadLetter::decode(&dead[0]).unwrap();
        assert_eq!(letter.envelope.job_id, env.job_id);
        assert_eq!(letter.error, "smtp timeout");
    }

    #[tokio::test]
    async fn test_malformed_entry_is_acked_and_dead_lettered() {
        let backend = MemoryBackend::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let engine = engine(&backend, move |_: EntryId, _: Envelope| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), JobError>(())
            }
        });
        backend.ensure_group(keys().queue(), GROUP).await.unwrap();
        let entry_id = backend.append(keys().queue(), "not json").await.unwrap();

        let outcome = engine.poll_once().await.unwrap();

        assert_eq!(outcome, Some(Outcome::Malformed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.acked(keys().queue(), GROUP), vec![entry_id]);
        assert_eq!(backend.dead_len(&keys().dead()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_uuid_job_id_is_malformed() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, always_ok);
        backend.ensure_group(keys().queue(), GROUP).await.unwrap();
        let raw = json!({"jobId": "order-42", "type": "email", "payload": {}, "retryCount": 0}).to_string();
        backend.append(keys().queue(), &raw).await.unwrap();

        let outcome = engine.poll_once().await.unwrap();

        assert_eq!(outcome, Some(Outcome::Malformed));
        let dead = backend.list_dead(&keys().dead(), 10, 0).await.unwrap();
        let record: serde_json::Value = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(record["raw"], raw);
    }

    #[tokio::test]
    async fn test_run_creates_group_and_stops_on_cancel() {
        let backend = MemoryBackend::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        let engine = engine(&backend, move |_: EntryId, _: Envelope| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), JobError>(())
            }
        });
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(cancel).await })
        };

        for _ in 0..3 {
            enqueue(&backend, &Envelope::new(JobId::new(), "email", json!({}))).await;
        }

        for _ in 0..100 {
            if processed.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 3);
        assert_eq!(backend.group_count(keys().queue()), 1);
        assert_eq!(backend.acked(keys().queue(), GROUP).len(), 3);
    }

    #[tokio::test]
    async fn test_schedule_failure_after_ack_is_retried() {
        let backend = Flaky::new(0, 1);
        let engine = backend.engine(always_fail);
        let env = Envelope::new(JobId::new(), "email", json!({}));
        enqueue(&backend.inner, &env).await;
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(cancel).await })
        };
        wait_for(|| backend.inner.delayed(&keys().delayed()).len() == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(backend.schedule_failures.load(Ordering::SeqCst), 0);
        assert_eq!(backend.inner.acked(keys().queue(), GROUP).len(), 1);
        assert!(backend.inner.pending(keys().queue(), GROUP).is_empty());
        assert_eq!(backend.inner.dead_len(&keys().dead()).await.unwrap(), 0);

        let delayed = backend.inner.delayed(&keys().delayed());
        assert_eq!(delayed.len(), 1);
        let retry = Envelope::decode(&delayed[0].1).unwrap();
        assert_eq!(retry.job_id, env.job_id);
        assert_eq!(retry.retry_count, 1);
    }

    #[tokio::test]
    async fn test_process_entry_retries_handoff_until_it_lands() {
        let backend = Flaky::new(0, 2);
        let engine = backend.engine(always_fail);
        backend.ensure_group(keys().queue(), GROUP).await.unwrap();
        enqueue(&backend.inner, &Envelope::new(JobId::new(), "email", json!({}))).await;

        let outcome = engine.poll_once().await.unwrap();

        assert!(matches!(outcome, Some(Outcome::Retrying { retry_count: 1, .. })));
        assert_eq!(backend.inner.delayed(&keys().delayed()).len(), 1);
    }

    #[tokio::test]
    async fn test_read_errors_back_off_without_touching_retries() {
        let backend = Flaky::new(3, 0);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let engine = backend.engine(move |_: EntryId, env: Envelope| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(env.retry_count);
                Ok::<(), JobError>(())
            }
        });
        let cancel = CancellationToken::new();
        enqueue(&backend.inner, &Envelope::new(JobId::new(), "email", json!({}))).await;

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(cancel).await })
        };
        wait_for(|| !seen.lock().unwrap().is_empty()).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(backend.read_failures.load(Ordering::SeqCst), 0);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(backend.inner.acked(keys().queue(), GROUP).len(), 1);
        assert_eq!(backend.inner.delayed_len(&keys().delayed()).await.unwrap(), 0);
        assert_eq!(backend.inner.dead_len(&keys().dead()).await.unwrap(), 0);
    }
}
