//! HTTP API for submitting jobs and inspecting the queue.

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};

use jobq_core::{
    DeadLetter, DeadLetterSink, JobId, JobRecord, JobRecordStore, JobStatus, JobUpdate, JobqError,
    Producer, QueueKeys, SharedBackend,
};

/// Application state shared across handlers.
pub struct AppState {
    pub producer: Producer<SharedBackend>,
    pub dead: DeadLetterSink<SharedBackend>,
    pub records: Arc<dyn JobRecordStore>,
}

impl AppState {
    pub fn new(backend: SharedBackend, keys: QueueKeys, records: Arc<dyn JobRecordStore>) -> Self {
        Self {
            dead: DeadLetterSink::new(backend.clone(), keys.dead()),
            producer: Producer::with_backend(backend, keys),
            records,
        }
    }
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Failure of an API call, rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal Server Error".to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.message)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(ErrorResponse {
            error: self.message.clone(),
        })
    }
}

// Storage details stay in the log, never in the response body.
impl From<JobqError> for ApiError {
    fn from(err: JobqError) -> Self {
        match err {
            JobqError::JobNotFound(_) => ApiError::not_found("Job not found"),
            err => {
                tracing::error!(error = %err, "API request failed");
                ApiError::internal()
            }
        }
    }
}

/// Response for health check.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Response for queue statistics.
#[derive(Serialize)]
pub struct StatsResponse {
    pub queue: usize,
    pub delayed: usize,
    pub dead: usize,
}

/// Request body for submitting a job.
#[derive(Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub payload: Option<serde_json::Value>,
}

/// Response for a submitted job.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Response for listing dead letters.
#[derive(Serialize)]
pub struct DeadListResponse {
    pub jobs: Vec<DeadLetter>,
    pub total: usize,
}

/// Query parameters for the dead-letter list.
#[derive(Deserialize)]
pub struct DeadListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    20
}

/// Configure API routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/jobs", web::post().to(create_job))
        .route("/jobs/{id}", web::get().to(get_job))
        .service(
            web::scope("/api")
                .route("/stats", web::get().to(stats))
                .route("/dead", web::get().to(list_dead)),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { status: "ok" })
}

async fn stats(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(StatsResponse {
        queue: state.producer.queue_len().await?,
        delayed: state.producer.delayed_len().await?,
        dead: state.producer.dead_len().await?,
    }))
}

/// Insert a PENDING record, enqueue, then remember the log entry id.
async fn create_job(
    state: web::Data<AppState>,
    body: web::Json<CreateJobRequest>,
) -> Result<HttpResponse, ApiError> {
    let CreateJobRequest { job_type, payload } = body.into_inner();
    let (job_type, payload) = match (job_type, payload) {
        (Some(job_type), Some(payload)) if !job_type.is_empty() => (job_type, payload),
        _ => return Err(ApiError::bad_request("Missing type or payload")),
    };

    let job_id = JobId::new();
    let record_payload = serde_json::json!({ "type": job_type, "payload": payload });
    state
        .records
        .insert(&job_id, JobStatus::Pending, &record_payload)
        .await?;

    let entry_id = state.producer.enqueue(job_id.clone(), job_type, payload).await?;

    state
        .records
        .update(&job_id, JobUpdate::entry_id(entry_id.clone()))
        .await?;

    tracing::info!(job_id = %job_id, entry_id = %entry_id, "Job submitted");

    Ok(HttpResponse::Created().json(CreateJobResponse {
        job_id,
        status: JobStatus::Pending,
    }))
}

async fn get_job(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    // A malformed id cannot name a record.
    let job_id: JobId = path
        .into_inner()
        .parse()
        .map_err(|_| ApiError::not_found("Job not found"))?;

    let record: JobRecord = state
        .records
        .get(&job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    Ok(HttpResponse::Ok().json(record))
}

async fn list_dead(
    state: web::Data<AppState>,
    query: web::Query<DeadListQuery>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit.min(1000);
    let jobs = state.dead.list(limit, query.offset).await?;
    let total = state.dead.len().await?;

    Ok(HttpResponse::Ok().json(DeadListResponse { jobs, total }))
}
