//! Backend abstraction for the log, the delay index and the dead-letter log.
//!
//! The three adapters are separate traits so a backend states exactly which
//! guarantees it provides. [`Backend`] ties them together and adds the one
//! operation that spans two of them: promoting due delay entries into the log.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::EntryId;
use crate::error::Result;

/// Append-only, consumer-group-aware log.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an encoded envelope, returning the id the log assigned to it.
    async fn append(&self, queue: &str, envelope_json: &str) -> Result<EntryId>;

    /// Create the consumer group at the start of the log, creating the log if absent.
    ///
    /// Must succeed without side effects when the group already exists.
    async fn ensure_group(&self, queue: &str, group: &str) -> Result<()>;

    /// Claim the next entry never delivered to this group.
    ///
    /// Blocks for at most `timeout`; returns `None` if nothing arrived.
    async fn read_next(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<(EntryId, String)>>;

    /// Acknowledge an entry, removing it from the group's pending set.
    async fn ack(&self, queue: &str, group: &str, entry_id: &EntryId) -> Result<()>;

    /// Number of entries in the log.
    async fn len(&self, queue: &str) -> Result<usize>;
}

/// Time-ordered set of envelopes keyed by a ready-at timestamp (Unix ms).
#[async_trait]
pub trait DelayIndex: Send + Sync {
    /// Insert an encoded envelope scored by `ready_at`.
    async fn schedule(&self, index: &str, ready_at: i64, envelope_json: &str) -> Result<()>;

    /// Atomically remove and return up to `limit` entries with score <= `now`.
    async fn pop_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>>;

    /// Return up to `limit` entries with score <= `now` without removing them.
    async fn peek_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>>;

    /// Remove one entry; returns whether it was present.
    async fn remove(&self, index: &str, envelope_json: &str) -> Result<bool>;

    /// Number of entries in the index.
    async fn delayed_len(&self, index: &str) -> Result<usize>;
}

/// Append-only terminal log.
#[async_trait]
pub trait DeadLetterLog: Send + Sync {
    /// Append a terminal record.
    async fn append_dead(&self, dlq: &str, record_json: &str) -> Result<EntryId>;

    /// Number of records in the dead-letter log.
    async fn dead_len(&self, dlq: &str) -> Result<usize>;

    /// List records in append order with pagination.
    async fn list_dead(&self, dlq: &str, limit: usize, offset: usize) -> Result<Vec<String>>;
}

/// A complete backend: log, delay index and dead-letter log sharing one broker.
#[async_trait]
pub trait Backend: LogStore + DelayIndex + DeadLetterLog {
    /// Move up to `limit` due entries from `index` to the tail of `queue`.
    ///
    /// The default pops then appends. An entry popped but not appended because
    /// the append failed is lost, so backends that can do both in one atomic
    /// step should override this.
    async fn promote_due(
        &self,
        index: &str,
        queue: &str,
        now: i64,
        limit: usize,
    ) -> Result<Vec<EntryId>> {
        let due = self.pop_due(index, now, limit).await?;
        let mut ids = Vec::with_capacity(due.len());
        for envelope_json in due {
            ids.push(self.append(queue, &envelope_json).await?);
        }
        Ok(ids)
    }
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
///
/// Constructed once per process and cloned into every component.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl LogStore for SharedBackend {
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
impl DelayIndex for SharedBackend {
    async fn schedule(&self, index: &str, ready_at: i64, envelope_json: &str) -> Result<()> {
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
impl DeadLetterLog for SharedBackend {
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

#[async_trait]
impl Backend for SharedBackend {
    async fn promote_due(
        &self,
        index: &str,
        queue: &str,
        now: i64,
        limit: usize,
    ) -> Result<Vec<EntryId>> {
        self.inner.promote_due(index, queue, now, limit).await
    }
}
