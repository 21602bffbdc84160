//! Error types for the jobq queue engine.

use thiserror::Error;

/// The main error type for jobq.
#[derive(Error, Debug)]
pub enum JobqError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Log, delay index or dead-letter log unreachable or rejecting a command.
    ///
    /// Loops treat this as transient: they log, back off and try again.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Job Record store failure.
    #[error("Record store error: {0}")]
    RecordStore(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// I/O error (binding listeners, reading env files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobqError {
    /// Whether the calling loop should retry after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobqError::Backend(_) | JobqError::Io(_))
    }
}

/// Result type alias using JobqError.
pub type Result<T> = std::result::Result<T, JobqError>;
