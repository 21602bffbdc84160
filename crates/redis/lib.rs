//! Redis backend for jobq.
//!
//! The live log and the dead-letter log are Redis Streams, the delay index is
//! a sorted set scored by ready-at milliseconds. Envelopes travel in the
//! stream field `data`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jobq_core::{JobId, Producer};
//! use jobq_redis::RedisBackend;
//!
//! #[tokio::main]
//! async fn main() -> jobq_core::Result<()> {
//!     let backend = RedisBackend::new("redis://localhost").await?;
//!     let producer = Producer::new(backend, "jobs_stream");
//!     producer.enqueue(JobId::new(), "email", serde_json::json!({})).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use jobq_core::{Backend, DeadLetterLog, DelayIndex, EntryId, JobqError, LogStore, Result};

/// Stream field holding the encoded envelope.
pub const DATA_FIELD: &str = "data";

/// Pops up to ARGV[2] members of KEYS[1] scored <= ARGV[1].
const POP_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
end
return due
"#;

/// Pops due members of KEYS[1] and appends each to stream KEYS[2].
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local ids = {}
for i, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    ids[i] = redis.call('XADD', KEYS[2], '*', ARGV[3], member)
end
return ids
"#;

/// Redis backend for job queue storage.
///
/// Short commands share one [`ConnectionManager`]. Blocking group reads run on
/// a dedicated connection per consumer so a `BLOCK` never stalls other
/// commands.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
    readers: Arc<Mutex<HashMap<String, MultiplexedConnection>>>,
}

impl RedisBackend {
    /// Connect to Redis.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| JobqError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            conn,
            readers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn reader(&self, consumer: &str) -> Result<MultiplexedConnection> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_reader(&self, consumer: &str) {
        self.readers.lock().await.remove(consumer);
    }
}

/// `BLOCK` argument for a read timeout. `BLOCK 0` means forever, so never go below 1ms.
fn block_millis(timeout: Duration) -> usize {
    usize::try_from(timeout.as_millis()).unwrap_or(usize::MAX).max(1)
}

/// First entry of an XREADGROUP reply.
///
/// An entry without a `data` field comes back with an empty body so the engine
/// dead-letters it instead of stalling on it.
fn first_entry(reply: StreamReadReply) -> Option<(EntryId, String)> {
    let entry = reply.keys.into_iter().next()?.ids.into_iter().next()?;
    let data = match entry.get::<String>(DATA_FIELD) {
        Some(data) => data,
        None => {
            tracing::warn!(entry_id = %entry.id, "Stream entry has no data field");
            String::new()
        }
    };
    Some((EntryId(entry.id), data))
}

#[async_trait]
impl LogStore for RedisBackend {
    async fn append(&self, queue: &str, envelope_json: &str) -> Result<EntryId> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(queue, "*", &[(DATA_FIELD, envelope_json)])
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(EntryId(id))
    }

    async fn ensure_group(&self, queue: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(queue, group, "0").await;
        match created {
            Ok(()) => {
                tracing::info!(queue, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(JobqError::Backend(e.to_string())),
        }
    }

    async fn read_next(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<(EntryId, String)>> {
        let mut conn = self.reader(consumer).await?;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block_millis(timeout));

        let reply: redis::RedisResult<Option<StreamReadReply>> =
            conn.xread_options(&[queue], &[">"], &opts).await;
        match reply {
            Ok(reply) => Ok(reply.and_then(first_entry)),
            Err(e) => {
                self.drop_reader(consumer).await;
                Err(JobqError::Backend(e.to_string()))
            }
        }
    }

    async fn ack(&self, queue: &str, group: &str, entry_id: &EntryId) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(queue, group, &[entry_id.as_str()])
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .xlen(queue)
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(len)
    }
}

#[async_trait]
impl DelayIndex for RedisBackend {
    async fn schedule(&self, index: &str, ready_at: i64, envelope_json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(index, envelope_json, ready_at)
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn pop_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::Script::new(POP_DUE_SCRIPT)
            .key(index)
            .arg(now)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(due)
    }

    async fn peek_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(index, "-inf", now, 0, limit as isize)
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(due)
    }

    async fn remove(&self, index: &str, envelope_json: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .zrem(index, envelope_json)
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn delayed_len(&self, index: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .zcard(index)
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(len)
    }
}

#[async_trait]
impl DeadLetterLog for RedisBackend {
    async fn append_dead(&self, dlq: &str, record_json: &str) -> Result<EntryId> {
        self.append(dlq, record_json).await
    }

    async fn dead_len(&self, dlq: &str) -> Result<usize> {
        self.len(dlq).await
    }

    async fn list_dead(&self, dlq: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(dlq, "-", "+", offset.saturating_add(limit))
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(reply
            .ids
            .into_iter()
            .skip(offset)
            .filter_map(|entry| entry.get::<String>(DATA_FIELD))
            .collect())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    /// Pops and re-appends in one Lua script, so concurrent schedulers can
    /// never promote the same entry twice.
    async fn promote_due(
        &self,
        index: &str,
        queue: &str,
        now: i64,
        limit: usize,
    ) -> Result<Vec<EntryId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::Script::new(PROMOTE_DUE_SCRIPT)
            .key(index)
            .key(queue)
            .arg(now)
            .arg(limit)
            .arg(DATA_FIELD)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| JobqError::Backend(e.to_string()))?;
        Ok(ids.into_iter().map(EntryId).collect())
    }
}


// ========== Integration Tests (require Redis) ==========
