//! # jobq-server - HTTP API and Worker Server
//!
//! Runs the submission API next to an optional worker pool. Both share one
//! backend and one Job Record store.
//!
//! ## Endpoints
//!
//! - `POST /jobs` submit `{type, payload}`, returns `201 {jobId, status}`
//! - `GET /jobs/{id}` fetch the Job Record
//! - `GET /health`
//! - `GET /api/stats` live, delayed and dead-letter depths
//! - `GET /api/dead?limit&offset` list dead letters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jobq_core::{EntryId, Envelope, JobResult};
//! use jobq_postgres::PgJobStore;
//! use jobq_redis::RedisBackend;
//! use jobq_server::{Server, ServerConfig};
//!
//! async fn process(_entry: EntryId, envelope: Envelope) -> JobResult {
//!     println!("Processing {} job {}", envelope.job_type, envelope.job_id);
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> jobq_core::Result<()> {
//!     let backend = RedisBackend::new("redis://localhost").await?;
//!     let records = PgJobStore::new("postgres://localhost/jobq").await?;
//!
//!     let config = ServerConfig::from_env()?;
//!     Server::new(config, backend, records, process).run().await
//! }
//! ```

mod api;
mod config;
mod server;

pub use api::{configure, AppState, ApiError};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use server::{Server, ServerBuilder};
