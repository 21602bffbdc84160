//! In-process backend.
//!
//! Keeps the log, delay index and dead-letter log behind one mutex, which
//! makes `pop_due` and `promote_due` trivially atomic. Useful for tests,
//! demos and single-process deployments that do not need durability.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::backend::{Backend, DeadLetterLog, DelayIndex, LogStore};
use crate::envelope::EntryId;
use crate::error::{JobqError, Result};

#[derive(Default)]
struct Stream {
    entries: Vec<(EntryId, String)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Index of the next never-delivered entry.
    cursor: usize,
    /// Delivered but unacknowledged entries, by consumer.
    pending: HashMap<EntryId, String>,
    /// Most recent acknowledgements, oldest first.
    acked: VecDeque<EntryId>,
}

/// Acknowledgements kept per group for [`MemoryBackend::acked`].
const ACK_HISTORY: usize = 1024;

struct Delayed {
    ready_at: i64,
    seq: u64,
    envelope_json: String,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    streams: HashMap<String, Stream>,
    delayed: HashMap<String, Vec<Delayed>>,
}

impl State {
    fn next_id(&mut self) -> EntryId {
        self.next_seq += 1;
        EntryId(format!("{}-0", self.next_seq))
    }

    fn append(&mut self, key: &str, data: &str) -> EntryId {
        let id = self.next_id();
        self.streams
            .entry(key.to_string())
            .or_default()
            .entries
            .push((id.clone(), data.to_string()));
        id
    }

    /// Due entries in (ready_at, insertion) order.
    fn due_positions(&self, index: &str, now: i64, limit: usize) -> Vec<usize> {
        let Some(entries) = self.delayed.get(index) else {
            return Vec::new();
        };
        let mut due: Vec<usize> = (0..entries.len())
            .filter(|&i| entries[i].ready_at <= now)
            .collect();
        due.sort_by_key(|&i| (entries[i].ready_at, entries[i].seq));
        due.truncate(limit);
        due
    }

    fn take_due(&mut self, index: &str, now: i64, limit: usize) -> Vec<String> {
        let mut positions = self.due_positions(index, now, limit);
        let Some(entries) = self.delayed.get_mut(index) else {
            return Vec::new();
        };
        let order: Vec<usize> = positions.clone();
        // Remove from the back so earlier positions stay valid.
        positions.sort_unstable_by(|a, b| b.cmp(a));
        let mut taken: HashMap<usize, String> = HashMap::with_capacity(positions.len());
        for pos in positions {
            taken.insert(pos, entries.remove(pos).envelope_json);
        }
        order
            .into_iter()
            .filter_map(|pos| taken.remove(&pos))
            .collect()
    }
}

/// In-memory backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| JobqError::Backend("memory backend lock poisoned".to_string()))
    }

    fn try_claim(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<(EntryId, String)>> {
        let mut state = self.lock()?;
        let stream = state
            .streams
            .get_mut(queue)
            .ok_or_else(|| JobqError::Backend(format!("no such log: {}", queue)))?;
        let next = {
            let group = stream
                .groups
                .get(group)
                .ok_or_else(|| JobqError::Backend(format!("no such group: {}", group)))?;
            stream.entries.get(group.cursor).cloned()
        };
        let Some((id, data)) = next else {
            return Ok(None);
        };
        if let Some(group) = stream.groups.get_mut(group) {
            group.cursor += 1;
            group.pending.insert(id.clone(), consumer.to_string());
        }
        Ok(Some((id, data)))
    }

    /// Ids acknowledged by `group`, in ack order. Only the most recent
    /// 1024 are kept.
    pub fn acked(&self, queue: &str, group: &str) -> Vec<EntryId> {
        self.lock()
            .ok()
            .and_then(|s| {
                s.streams
                    .get(queue)
                    .and_then(|st| st.groups.get(group))
                    .map(|g| g.acked.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Delivered but unacknowledged entries of `group`, with their consumer.
    pub fn pending(&self, queue: &str, group: &str) -> Vec<(EntryId, String)> {
        let mut pending: Vec<(EntryId, String)> = self
            .lock()
            .ok()
            .and_then(|s| {
                s.streams
                    .get(queue)
                    .and_then(|st| st.groups.get(group))
                    .map(|g| g.pending.clone().into_iter().collect())
            })
            .unwrap_or_default();
        pending.sort();
        pending
    }

    /// Number of consumer groups on `queue`.
    pub fn group_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.streams.get(queue).map(|st| st.groups.len()))
            .unwrap_or(0)
    }

    /// Every entry ever appended to `queue`, in log order.
    pub fn entries(&self, queue: &str) -> Vec<(EntryId, String)> {
        self.lock()
            .ok()
            .and_then(|s| s.streams.get(queue).map(|st| st.entries.clone()))
            .unwrap_or_default()
    }

    /// Snapshot of the delay index as `(ready_at, envelope_json)` pairs.
    pub fn delayed(&self, index: &str) -> Vec<(i64, String)> {
        let mut entries: Vec<(i64, u64, String)> = self
            .lock()
            .ok()
            .and_then(|s| {
                s.delayed.get(index).map(|d| {
                    d.iter()
                        .map(|e| (e.ready_at, e.seq, e.envelope_json.clone()))
                        .collect()
                })
            })
            .unwrap_or_default();
        entries.sort_by_key(|(ready_at, seq, _)| (*ready_at, *seq));
        entries
            .into_iter()
            .map(|(ready_at, _, json)| (ready_at, json))
            .collect()
    }
}

#[async_trait]
impl LogStore for MemoryBackend {
    async fn append(&self, queue: &str, envelope_json: &str) -> Result<EntryId> {
        let id = self.lock()?.append(queue, envelope_json);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, queue: &str, group: &str) -> Result<()> {
        let mut state = self.lock()?;
        let stream = state.streams.entry(queue.to_string()).or_default();
        if !stream.groups.contains_key(group) {
            stream.groups.insert(group.to_string(), Group::default());
            tracing::debug!(queue, group, "Created consumer group");
        }
        Ok(())
    }

    async fn read_next(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<(EntryId, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before looking so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.try_claim(queue, group, consumer)? {
                return Ok(Some(claimed));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, queue: &str, group: &str, entry_id: &EntryId) -> Result<()> {
        let mut state = self.lock()?;
        let group = state
            .streams
            .get_mut(queue)
            .and_then(|st| st.groups.get_mut(group))
            .ok_or_else(|| JobqError::Backend(format!("no such group: {}", group)))?;
        if group.pending.remove(entry_id).is_some() {
            if group.acked.len() == ACK_HISTORY {
                group.acked.pop_front();
            }
            group.acked.push_back(entry_id.clone());
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .streams
            .get(queue)
            .map(|st| st.entries.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl DelayIndex for MemoryBackend {
    async fn schedule(&self, index: &str, ready_at: i64, envelope_json: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.next_seq += 1;
        let seq = state.next_seq;
        state.delayed.entry(index.to_string()).or_default().push(Delayed {
            ready_at,
            seq,
            envelope_json: envelope_json.to_string(),
        });
        Ok(())
    }

    async fn pop_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        Ok(self.lock()?.take_due(index, now, limit))
    }

    async fn peek_due(&self, index: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let state = self.lock()?;
        let positions = state.due_positions(index, now, limit);
        let entries = match state.delayed.get(index) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        Ok(positions
            .into_iter()
            .map(|pos| entries[pos].envelope_json.clone())
            .collect())
    }

    async fn remove(&self, index: &str, envelope_json: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(entries) = state.delayed.get_mut(index) else {
            return Ok(false);
        };
        match entries.iter().position(|e| e.envelope_json == envelope_json) {
            Some(pos) => {
                entries.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delayed_len(&self, index: &str) -> Result<usize> {
        Ok(self.lock()?.delayed.get(index).map(Vec::len).unwrap_or(0))
    }
}

#[async_trait]
impl DeadLetterLog for MemoryBackend {
    async fn append_dead(&self, dlq: &str, record_json: &str) -> Result<EntryId> {
        Ok(self.lock()?.append(dlq, record_json))
    }

    async fn dead_len(&self, dlq: &str) -> Result<usize> {
        self.len(dlq).await
    }

    async fn list_dead(&self, dlq: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .streams
            .get(dlq)
            .map(|st| {
                st.entries
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(_, data)| data.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn promote_due(
        &self,
        index: &str,
        queue: &str,
        now: i64,
        limit: usize,
    ) -> Result<Vec<EntryId>> {
        let ids: Vec<EntryId> = {
            let mut state = self.lock()?;
            let due = state.take_due(index, now, limit);
            due.iter().map(|json| state.append(queue, json)).collect()
        };
        if !ids.is_empty() {
            self.appended.notify_waiters();
        }
        Ok(ids)
    }
}
