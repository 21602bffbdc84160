//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use jobq_core::{JobqError, WorkerConfig, DEFAULT_GROUP, DEFAULT_QUEUE};

/// Configuration for the jobq server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the API server to.
    pub api_addr: SocketAddr,
    /// Live log name.
    pub queue: String,
    /// Consumer group.
    pub group: String,
    /// Consumer name prefix. Generated if not set.
    pub consumer_name: Option<String>,
    /// Number of worker tasks to spawn. Zero serves the API only.
    pub num_workers: usize,
    /// Timeout for a single blocking read.
    pub fetch_timeout: Duration,
    /// Whether this process runs the delayed-retry scheduler.
    pub enable_scheduler: bool,
    /// Interval for the scheduler loop.
    pub scheduler_interval: Duration,
    /// Batch size for the scheduler.
    pub batch_size: usize,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            queue: DEFAULT_QUEUE.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer_name: None,
            num_workers: 1,
            fetch_timeout: Duration::from_secs(5),
            enable_scheduler: true,
            scheduler_interval: Duration::from_secs(1),
            batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a new builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Defaults overridden by `API_ADDR` (or `API_PORT`), `QUEUE_NAME`,
    /// `GROUP_NAME`, `WORKER_ID` and `NUM_WORKERS`.
    pub fn from_env() -> Result<Self, JobqError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, JobqError> {
        let mut config = Self::default();

        if let Some(addr) = get("API_ADDR") {
            config.api_addr = addr
                .parse()
                .map_err(|e| JobqError::Config(format!("API_ADDR {:?}: {}", addr, e)))?;
        } else if let Some(port) = get("API_PORT") {
            let port: u16 = port
                .parse()
                .map_err(|e| JobqError::Config(format!("API_PORT {:?}: {}", port, e)))?;
            config.api_addr = SocketAddr::from(([0, 0, 0, 0], port));
        }
        if let Some(queue) = get("QUEUE_NAME") {
            config.queue = queue;
        }
        if let Some(group) = get("GROUP_NAME") {
            config.group = group;
        }
        if let Some(name) = get("WORKER_ID") {
            config.consumer_name = Some(name);
        }
        if let Some(workers) = get("NUM_WORKERS") {
            config.num_workers = workers
                .parse()
                .map_err(|e| JobqError::Config(format!("NUM_WORKERS {:?}: {}", workers, e)))?;
        }
        Ok(config)
    }

    /// Worker pool settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queue: self.queue.clone(),
            group: self.group.clone(),
            consumer_name: self.consumer_name.clone(),
            num_workers: self.num_workers,
            fetch_timeout: self.fetch_timeout,
            enable_scheduler: self.enable_scheduler,
            scheduler_interval: self.scheduler_interval,
            batch_size: self.batch_size,
            shutdown_timeout: self.shutdown_timeout,
            ..WorkerConfig::default()
        }
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API bind address.
    pub fn api_addr(mut self, addr: SocketAddr) -> Self {
        self.config.api_addr = addr;
        self
    }

    /// Set the API bind address from a string.
    pub fn api_addr_str(mut self, addr: &str) -> Result<Self, std::net::AddrParseError> {
        self.config.api_addr = addr.parse()?;
        Ok(self)
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

    /// Enable or disable the scheduler.
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

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
