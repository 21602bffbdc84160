//! Names of the log, delay index and dead-letter log for one queue.

/// Default log name.
pub const DEFAULT_QUEUE: &str = "jobs_stream";

/// Default consumer group name.
pub const DEFAULT_GROUP: &str = "workers_group";

/// Derives backend key names from a queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    queue: String,
}

impl QueueKeys {
    /// Create a new QueueKeys instance for the given queue.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// The live log (stream).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The delay index (sorted set scored by ready-at milliseconds).
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.queue)
    }

    /// The dead-letter log (stream).
    pub fn dead(&self) -> String {
        format!("{}:dlq", self.queue)
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("jobs_stream");
        assert_eq!(keys.queue(), "jobs_stream");
        assert_eq!(keys.delayed(), "jobs_stream:delayed");
        assert_eq!(keys.dead(), "jobs_stream:dlq");
    }

    #[test]
    fn test_queue_keys_default() {
        assert_eq!(QueueKeys::default().queue(), DEFAULT_QUEUE);
    }

    #[test]
    fn test_queue_keys_complex_name() {
        let keys = QueueKeys::new("app:v2:queue");
        assert_eq!(keys.delayed(), "app:v2:queue:delayed");
        assert_eq!(keys.dead(), "app:v2:queue:dlq");
    }
}
