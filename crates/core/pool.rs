//! Worker pool: N consumer engines plus an optional delayed-retry scheduler.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::config::{generate_consumer_name, WorkerConfig};
use crate::engine::{ConsumerEngine, JobHandler};
use crate::error::{JobqError, Result};
use crate::keys::QueueKeys;
use crate::scheduler::Scheduler;

/// Builder for WorkerPool.
pub struct WorkerPoolBuilder<H: JobHandler> {
    config: WorkerConfig,
    handler: Option<H>,
    backend: Option<SharedBackend>,
}

impl<H: JobHandler> Default for WorkerPoolBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: JobHandler> WorkerPoolBuilder<H> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            handler: None,
            backend: None,
        }
    }

    /// Set the backend.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(SharedBackend::new(backend));
        self
    }

    /// Use an already shared backend.
    pub fn shared_backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the live log name.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = queue.into();
        self
    }

    /// Set the consumer group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Set the consumer name prefix.
    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.config.consumer_name = Some(name.into());
        self
    }

    /// Set the number of workers.
    pub fn workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the job handler.
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Set the pause after an engine-level error.
    pub fn error_backoff(mut self, backoff: std::time::Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Enable or disable this pool's scheduler.
    pub fn scheduler(mut self, enabled: bool) -> Self {
        self.config.enable_scheduler = enabled;
        self
    }

    /// Set the scheduler interval.
    pub fn scheduler_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.scheduler_interval = interval;
        self
    }

    /// Set the scheduler batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.config.max_retries = max;
        self
    }

    /// Set the backoff base.
    pub fn retry_base_delay(mut self, delay: std::time::Duration) -> Self {
        self.config.retry_base_delay = delay;
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the WorkerPool with the configured backend.
    pub fn build(self) -> Result<WorkerPool<H, SharedBackend>> {
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| JobqError::Config("Backend is required".to_string()))?;
        self.build_with_backend(backend)
    }

    /// Build the WorkerPool with a custom backend.
    pub fn build_with_backend<B: Backend + Clone + 'static>(
        self,
        backend: B,
    ) -> Result<WorkerPool<H, B>> {
        let handler = self
            .handler
            .ok_or_else(|| JobqError::Config("Handler is required".to_string()))?;
        if self.config.num_workers == 0 {
            return Err(JobqError::Config("At least one worker is required".to_string()));
        }

        Ok(WorkerPool::new(self.config, handler, backend))
    }
}

/// Worker pool for processing jobs.
pub struct WorkerPool<H: JobHandler, B: Backend + Clone + 'static = SharedBackend> {
    config: WorkerConfig,
    handler: Arc<H>,
    backend: B,
    consumer_name: String,
    cancel: CancellationToken,
}

impl<H: JobHandler> WorkerPool<H, SharedBackend> {
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder<H> {
        WorkerPoolBuilder::new()
    }
}

impl<H: JobHandler, B: Backend + Clone + 'static> WorkerPool<H, B> {
    /// Create a new worker pool with the given configuration, handler, and backend.
    pub fn new(config: WorkerConfig, handler: H, backend: B) -> Self {
        let consumer_name = config
            .consumer_name
            .clone()
            .unwrap_or_else(generate_consumer_name);

        Self {
            config,
            handler: Arc::new(handler),
            backend,
            consumer_name,
            cancel: CancellationToken::new(),
        }
    }

    /// Consumer name prefix used by this pool.
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Token that stops the pool when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run until `shutdown` resolves or the pool's token is cancelled.
    ///
    /// Engines finish the entry they hold before stopping. Tasks still
    /// running after `shutdown_timeout` are aborted.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let keys = QueueKeys::new(self.config.queue.clone());

        // A missing group is fatal, so fail here rather than in every engine.
        self.backend
            .ensure_group(keys.queue(), &self.config.group)
            .await?;

        let mut tasks = JoinSet::new();

        if self.config.enable_scheduler {
            let scheduler = Scheduler::new(
                self.backend.clone(),
                keys.clone(),
                self.config.scheduler_interval,
                self.config.batch_size,
            );
            let cancel = self.cancel.clone();
            tasks.spawn(async move { scheduler.run(cancel).await });
        }

        for index in 0..self.config.num_workers {
            let engine = ConsumerEngine::new(
                self.backend.clone(),
                keys.clone(),
                self.config.group.clone(),
                self.config.consumer_id(&self.consumer_name, index),
                self.handler.clone(),
            )
            .retry_policy(self.config.retry_policy())
            .fetch_timeout(self.config.fetch_timeout)
            .error_backoff(self.config.error_backoff);
            let cancel = self.cancel.clone();
            tasks.spawn(async move { engine.run(cancel).await });
        }

        tracing::info!(
            workers = self.config.num_workers,
            queue = %keys.queue(),
            group = %self.config.group,
            consumer = %self.consumer_name,
            scheduler = self.config.enable_scheduler,
            "Worker pool started"
        );

        tokio::select! {
            _ = shutdown => {}
            _ = self.cancel.cancelled() => {}
        }
        tracing::info!("Shutdown requested, draining...");
        self.cancel.cancel();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Task failed"),
                    Err(e) => tracing::error!(error = %e, "Task panicked"),
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "Shutdown timeout reached, forcing stop"
            );
            tasks.shutdown().await;
        }

        tracing::info!(consumer = %self.consumer_name, "Worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeadLetterLog, DelayIndex, LogStore};
    use crate::engine::{JobError, JobResult, Outcome};
    use crate::envelope::{DeadLetter, EntryId, Envelope, JobId};
    use crate::memory::MemoryBackend;
    use crate::producer::Producer;
    use crate::store::{JobRecordStore, JobStatus, MemoryRecordStore, RecordTracking};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn always_fail(_: EntryId, _: Envelope) -> JobResult {
        Err(JobError::new("always fails"))
    }

    struct Noop;

    #[async_trait::async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _: &EntryId, _: &Envelope) -> JobResult {
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_builder_requires_handler_and_backend() {
        let missing_handler = WorkerPoolBuilder::<Noop>::new()
            .backend(MemoryBackend::new())
            .build();
        assert!(matches!(missing_handler, Err(JobqError::Config(_))));

        let missing_backend = WorkerPool::builder().handler(Noop).build();
        let zero_workers = WorkerPool::builder()
            .handler(Noop)
            .workers(0)
            .build_with_backend(MemoryBackend::new());
        assert!(matches!(zero_workers, Err(JobqError::Config(_))));
        assert!(matches!(missing_backend, Err(JobqError::Config(_))));
    }

    #[tokio::test]
    async fn test_email_job_completes() {
        let backend = MemoryBackend::new();
        let records = MemoryRecordStore::new();
        let producer = Producer::with_backend(backend.clone(), QueueKeys::default());

        let job_id = JobId::new();
        let payload = json!({"to": "a@b.com"});
        records.insert(&job_id, JobStatus::Pending, &payload).await.unwrap();
        producer.enqueue(job_id.clone(), "email", payload).await.unwrap();

        let handler = RecordTracking::new(
            records.clone(),
            |_: EntryId, _: Envelope| async { Ok::<(), JobError>(()) },
            "worker-test",
        );
        let pool = WorkerPool::builder()
            .handler(handler)
            .consumer_name("worker-test")
            .fetch_timeout(Duration::from_millis(20))
            .build_with_backend(backend.clone())
            .unwrap();

        let token = pool.cancellation_token();
        let watcher = {
            let backend = backend.clone();
            tokio::spawn(async move {
                wait_for(|| backend.acked("jobs_stream", "workers_group").len() == 1).await;
                token.cancel();
            })
        };
        pool.run_until(std::future::pending()).await.unwrap();
        watcher.await.unwrap();

        let record = records.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(backend.acked("jobs_stream", "workers_group").len(), 1);
        assert_eq!(backend.delayed_len("jobs_stream:delayed").await.unwrap(), 0);
        assert_eq!(backend.dead_len("jobs_stream:dlq").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_always_failing_job_is_dead_lettered_end_to_end() {
        let backend = MemoryBackend::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handler = move |_: EntryId, _: Envelope| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), JobError>(JobError::new("always fails"))
            }
        };
        let pool = WorkerPool::builder()
            .handler(handler)
            .workers(2)
            .consumer_name("w")
            .fetch_timeout(Duration::from_millis(20))
            .scheduler_interval(Duration::from_millis(5))
            .retry_base_delay(Duration::from_millis(1))
            .build_with_backend(backend.clone())
            .unwrap();
        let producer = Producer::with_backend(backend.clone(), QueueKeys::default());
        let job_id = JobId::new();
        producer.enqueue(job_id.clone(), "email", json!({})).await.unwrap();

        let token = pool.cancellation_token();
        let watcher = {
            let backend = backend.clone();
            tokio::spawn(async move {
                wait_for(|| backend.entries("jobs_stream:dlq").len() == 1).await;
                token.cancel();
            })
        };
        pool.run_until(std::future::pending()).await.unwrap();
        watcher.await.unwrap();

        // One first attempt plus three retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(backend.entries("jobs_stream").len(), 4);
        assert_eq!(backend.acked("jobs_stream", "workers_group").len(), 4);

        let dead = backend.list_dead("jobs_stream:dlq", 10, 0).await.unwrap();
        assert_eq!(dead.len(), 1);
        let letter = DeadLetter::decode(&dead[0]).unwrap();
        assert_eq!(letter.envelope.job_id, job_id);
        assert_eq!(letter.envelope.retry_count, 3);
    }

    #[tokio::test]
    async fn test_retry_cycles_use_2_4_8_second_backoffs() {
        // Drive the engine and scheduler by hand with an explicit clock.
        let backend = MemoryBackend::new();
        let keys = QueueKeys::default();
        backend.ensure_group(keys.queue(), "workers_group").await.unwrap();
        let engine = ConsumerEngine::new(
            backend.clone(),
            keys.clone(),
            "workers_group",
            "worker-1",
            Arc::new(always_fail),
        )
        .fetch_timeout(Duration::from_millis(20));
        let scheduler = Scheduler::new(backend.clone(), keys.clone(), Duration::from_secs(1), 100);
        Producer::with_backend(backend.clone(), keys.clone())
            .enqueue(JobId::new(), "email", json!({}))
            .await
            .unwrap();

        let mut backoffs = Vec::new();
        loop {
            let failed_at = crate::envelope::now_millis();
            match engine.poll_once().await.unwrap() {
                Some(Outcome::Retrying { ready_at, .. }) => {
                    backoffs.push(ready_at - failed_at);
                    // Not yet due just before ready_at.
                    assert!(scheduler.tick_at(ready_at - 1).await.unwrap().is_empty());
                    assert_eq!(scheduler.tick_at(ready_at).await.unwrap().len(), 1);
                }
                Some(Outcome::DeadLettered) => break,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(backoffs.len(), 3);
        for (got, want) in backoffs.iter().zip([2000, 4000, 8000]) {
            // The engine reads the clock a moment after `failed_at`.
            assert!(*got >= want && *got < want + 1000, "backoff {} vs {}", got, want);
        }
        assert_eq!(backend.dead_len(&keys.dead()).await.unwrap(), 1);
        assert_eq!(backend.delayed_len(&keys.delayed()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_leaves_retries_delayed() {
        let backend = MemoryBackend::new();
        let pool = WorkerPool::builder()
            .handler(always_fail)
            .consumer_name("w")
            .scheduler(false)
            .fetch_timeout(Duration::from_millis(20))
            .retry_base_delay(Duration::from_millis(1))
            .build_with_backend(backend.clone())
            .unwrap();
        Producer::with_backend(backend.clone(), QueueKeys::default())
            .enqueue(JobId::new(), "email", json!({}))
            .await
            .unwrap();

        let token = pool.cancellation_token();
        let watcher = {
            let backend = backend.clone();
            tokio::spawn(async move {
                wait_for(|| backend.delayed("jobs_stream:delayed").len() == 1).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };
        pool.run_until(std::future::pending()).await.unwrap();
        watcher.await.unwrap();

        assert_eq!(backend.entries("jobs_stream").len(), 1);
        assert_eq!(backend.delayed("jobs_stream:delayed").len(), 1);
    }
}
