//! Retry policy: decides whether a failed attempt is retried or dead-lettered.
//!
//! The decision is a pure function of the envelope, the error message and the
//! current time. Handing the result to the delay index or the dead-letter sink
//! is left to the caller.

use std::time::Duration;

use crate::envelope::{DeadLetter, DelayEntry, Envelope};

/// Default number of retries after the first attempt.
pub const MAX_RETRIES: u32 = 3;

/// Default backoff base.
pub const BASE_DELAY: Duration = Duration::from_millis(1000);

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry later: insert into the delay index.
    Scheduled(DelayEntry),
    /// Retry budget spent: record in the dead-letter log.
    Exhausted(DeadLetter),
}

/// Exponential backoff retry policy.
///
/// Retry `n` (1-based) becomes eligible `base * 2^n` after the failure, so the
/// defaults give 2s, 4s and 8s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries.
    pub max_retries: u32,
    /// Backoff base.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry budget and the default base delay.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the backoff base.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Check if an envelope has retries left.
    pub fn can_retry(&self, envelope: &Envelope) -> bool {
        envelope.retry_count < self.max_retries
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier)
    }

    /// Decide what happens to `envelope` after it failed with `error` at `now` (Unix ms).
    pub fn on_failure(&self, envelope: &Envelope, error: &str, now: i64) -> RetryDecision {
        if self.can_retry(envelope) {
            let next = envelope.next_attempt(error);
            let backoff = i64::try_from(self.backoff(next.retry_count).as_millis()).unwrap_or(i64::MAX);
            RetryDecision::Scheduled(DelayEntry {
                ready_at: now.saturating_add(backoff),
                envelope: next,
            })
        } else {
            RetryDecision::Exhausted(DeadLetter {
                envelope: envelope.clone(),
                failed_at: now,
                error: error.to_string(),
            })
        }
    }
}
