//! # jobq-core - Core queue engine
//!
//! This crate provides the broker-independent parts of the jobq queue:
//! - `LogStore`, `DelayIndex` and `DeadLetterLog` adapter traits, tied together by `Backend`
//! - `Envelope`, the retry-carrying unit of work, and its delay/dead-letter forms
//! - `RetryPolicy` and the `ConsumerEngine` that applies it
//! - `Scheduler` for promoting due retries back into the log
//! - `Producer` for enqueueing jobs
//! - `WorkerPool` for running engines and a scheduler together
//! - `JobRecordStore` for the user-visible job status mirror
//! - `MemoryBackend` and `MemoryRecordStore` for tests and single-process use

mod backend;
mod config;
mod dead_letter;
mod engine;
mod envelope;
mod error;
mod keys;
mod memory;
mod pool;
mod producer;
mod retry;
mod scheduler;
mod store;

pub use backend::{Backend, DeadLetterLog, DelayIndex, DynBackend, LogStore, SharedBackend};
pub use config::{generate_consumer_name, WorkerConfig, WorkerConfigBuilder};
pub use dead_letter::DeadLetterSink;
pub use engine::{ConsumerEngine, JobError, JobHandler, JobResult, Outcome};
pub use envelope::{now_millis, DeadLetter, DelayEntry, EntryId, Envelope, JobId};
pub use error::{JobqError, Result};
pub use keys::{QueueKeys, DEFAULT_GROUP, DEFAULT_QUEUE};
pub use memory::MemoryBackend;
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use producer::Producer;
pub use retry::{RetryDecision, RetryPolicy, BASE_DELAY, MAX_RETRIES};
pub use scheduler::{PromotionMode, Scheduler};
pub use store::{JobRecord, JobRecordStore, JobStatus, JobUpdate, MemoryRecordStore, RecordTracking};
