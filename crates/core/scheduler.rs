//! Delayed-retry scheduler: promotes due delay-index entries back into the log.

use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::envelope::{now_millis, EntryId};
use crate::error::Result;
use crate::keys::QueueKeys;

/// How due entries leave the delay index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromotionMode {
    /// Pop-if-due and append as one backend-atomic step. Safe with any number
    /// of concurrent schedulers.
    #[default]
    Atomic,
    /// Peek, append, then remove. Two schedulers can both append the same
    /// entry before either removes it.
    RemoveAfterAppend,
}

/// Background task that moves due retries to the tail of the live log.
pub struct Scheduler<B: Backend> {
    backend: B,
    keys: QueueKeys,
    interval: Duration,
    batch_size: usize,
    mode: PromotionMode,
}

impl<B: Backend> Scheduler<B> {
    /// Create a new Scheduler.
    pub fn new(backend: B, keys: QueueKeys, interval: Duration, batch_size: usize) -> Self {
        Self {
            backend,
            keys,
            interval,
            batch_size,
            mode: PromotionMode::Atomic,
        }
    }

    pub fn mode(mut self, mode: PromotionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run the scheduler loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(queue = %self.keys.queue(), mode = ?self.mode, "Scheduler started");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Scheduler tick failed");
            }
        }

        tracing::info!(queue = %self.keys.queue(), "Scheduler stopped");
        Ok(())
    }

    /// Promote everything due now.
    pub async fn tick(&self) -> Result<Vec<EntryId>> {
        self.tick_at(now_millis()).await
    }

    /// Promote everything with `ready_at <= now`.
    pub async fn tick_at(&self, now: i64) -> Result<Vec<EntryId>> {
        let promoted = match self.mode {
            PromotionMode::Atomic => {
                self.backend
                    .promote_due(&self.keys.delayed(), self.keys.queue(), now, self.batch_size)
                    .await?
            }
            PromotionMode::RemoveAfterAppend => self.append_then_remove(now).await?,
        };

        if !promoted.is_empty() {
            tracing::debug!(
                count = promoted.len(),
                queue = %self.keys.queue(),
                "Promoted delayed jobs to queue"
            );
        }
        Ok(promoted)
    }

    async fn append_then_remove(&self, now: i64) -> Result<Vec<EntryId>> {
        let index = self.keys.delayed();
        let due = self.backend.peek_due(&index, now, self.batch_size).await?;

        let mut ids = Vec::with_capacity(due.len());
        for envelope_json in due {
            ids.push(self.backend.append(self.keys.queue(), &envelope_json).await?);
            if !self.backend.remove(&index, &envelope_json).await? {
                tracing::warn!(queue = %self.keys.queue(), "Promoted entry was already removed");
            }
        }
        Ok(ids)
    }
}
