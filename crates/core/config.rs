//! Configuration types for the worker pool.

use std::time::Duration;

use crate::keys::{DEFAULT_GROUP, DEFAULT_QUEUE};
use crate::retry::{RetryPolicy, BASE_DELAY, MAX_RETRIES};

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Live log name.
    pub queue: String,
    /// Consumer group shared by every worker.
    pub group: String,
    /// Consumer name prefix. Generated from host and pid if not set.
    pub consumer_name: Option<String>,
    /// Number of engine loops to spawn, each with its own consumer id.
    pub num_workers: usize,
    /// Upper bound on a single blocking read.
    pub fetch_timeout: Duration,
    /// Pause after an engine-level error.
    pub error_backoff: Duration,
    /// Whether this pool runs a delayed-retry scheduler.
    pub enable_scheduler: bool,
    /// Interval for the scheduler loop.
    pub scheduler_interval: Duration,
    /// Maximum entries promoted per scheduler tick.
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer_name: None,
            num_workers: 1,
            fetch_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            enable_scheduler: true,
            scheduler_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: MAX_RETRIES,
            retry_base_delay: BASE_DELAY,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Retry policy built from `max_retries` and `retry_base_delay`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(self.max_retries).base_delay(self.retry_base_delay)
    }

    /// Consumer id of worker `index`: the bare name for a single worker,
    /// `<name>-<index>` otherwise.
    pub fn consumer_id(&self, name: &str, index: usize) -> String {
        if self.num_workers <= 1 {
            name.to_string()
        } else {
            format!("{}-{}", name, index)
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
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
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Enable or disable the scheduler for this pool.
    pub fn enable_scheduler(mut self, enabled: bool) -> Self {
        self.config.enable_scheduler = enabled;
        self
    }

    /// Set the scheduler interval.
    pub fn scheduler_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler_interval = interval;
        self
    }

    /// Set the batch size for the scheduler.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry_base_delay = delay;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Default consumer name: `worker-<host>-<pid>`.
pub fn generate_consumer_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("worker-{}-{}", host, std::process::id())
}
