//! Basic demo using the in-memory backend.
//!
//! Enqueues a handful of email jobs plus one job that always fails, then runs
//! a worker pool long enough for the failing job to exhaust its retries and
//! land in the dead-letter log.
//!
//! Run with: `cargo run -p demo-basic`

use std::time::Duration;

use serde::{Deserialize, Serialize};
use jobq_core::{
    DeadLetterSink, EntryId, Envelope, JobError, JobId, JobRecordStore, JobResult, JobStatus,
    MemoryBackend, MemoryRecordStore, Producer, QueueKeys, RecordTracking, WorkerPool,
};

/// Email notification job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
}

async fn process(_entry_id: EntryId, envelope: Envelope) -> JobResult {
    match envelope.job_type.as_str() {
        "send_email" => {
            let email: EmailJob = serde_json::from_value(envelope.payload)?;
            println!("[email] sending to: {} ({})", email.to, email.subject);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
        other => Err(JobError::new(format!("no handler for job type {:?}", other))),
    }
}

#[tokio::main]
async fn main() -> jobq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("jobq in-memory demo\n");

    let backend = MemoryBackend::new();
    let records = MemoryRecordStore::new();
    let keys = QueueKeys::default();
    let producer = Producer::new(backend.clone(), keys.queue());

    let emails = [
        ("alice@example.com", "Welcome!"),
        ("bob@example.com", "Your order shipped"),
        ("charlie@example.com", "Password reset"),
    ];

    let mut submitted = Vec::new();
    for (to, subject) in emails {
        let payload = serde_json::to_value(EmailJob {
            to: to.to_string(),
            subject: subject.to_string(),
        })?;
        let job_id = JobId::new();
        records.insert(&job_id, JobStatus::Pending, &payload).await?;
        let entry_id = producer.enqueue(job_id.clone(), "send_email", payload).await?;
        println!("  enqueued: {} -> {}", job_id, entry_id);
        submitted.push(job_id);
    }

    let doomed = JobId::new();
    records
        .insert(&doomed, JobStatus::Pending, &serde_json::json!({}))
        .await?;
    producer
        .enqueue(doomed.clone(), "render_report", serde_json::json!({}))
        .await?;
    submitted.push(doomed);

    println!("\nQueue length: {}", producer.queue_len().await?);
    println!("Starting worker pool (2 workers), stopping after 6s or Ctrl+C\n");

    let handler = RecordTracking::new(records.clone(), process, "demo-basic");
    let pool = WorkerPool::builder()
        .backend(backend.clone())
        .consumer_name("demo-basic")
        .workers(2)
        .handler(handler)
        .fetch_timeout(Duration::from_millis(500))
        .scheduler_interval(Duration::from_millis(100))
        .retry_base_delay(Duration::from_millis(200))
        .shutdown_timeout(Duration::from_secs(5))
        .build()?;

    pool.run_until(async {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(6)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    })
    .await?;

    println!("\nFinal job records:");
    for job_id in &submitted {
        if let Some(record) = records.get(job_id).await? {
            println!("  {} {}", record.id, record.status);
        }
    }

    let dead = DeadLetterSink::new(backend, keys.dead());
    for letter in dead.list(10, 0).await? {
        println!(
            "\ndead letter: {} after {} retries: {}",
            letter.envelope.job_id, letter.envelope.retry_count, letter.error
        );
    }

    Ok(())
}
