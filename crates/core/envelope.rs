//! Job envelope and the entries that carry it through the log, the delay
//! index and the dead-letter log.
//!
//! The envelope travels as JSON with camelCase keys:
//!
//! ```json
//! {"jobId":"...","type":"email","payload":{"to":"a@b.com"},"retryCount":0}
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a job, shared by the envelope and the Job Record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier assigned by the log on append. Only used for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The retry-carrying unit of work.
///
/// Never mutated once appended: a retry builds a new value through
/// [`Envelope::next_attempt`] and travels as a new log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Foreign key to the Job Record.
    pub job_id: JobId,
    /// Job type, used by handlers to dispatch.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque job payload.
    pub payload: serde_json::Value,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Error message from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Envelope {
    /// Create a first-attempt envelope.
    pub fn new(job_id: JobId, job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            payload,
            retry_count: 0,
            last_error: None,
        }
    }

    /// The envelope for the next attempt after a failure with `error`.
    pub fn next_attempt(&self, error: impl Into<String>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_error: Some(error.into()),
            ..self.clone()
        }
    }

    /// 1-based attempt number this envelope represents.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Serialize the envelope to JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from JSON.
    pub fn decode(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// An envelope waiting in the delay index until `ready_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayEntry {
    /// Unix timestamp in milliseconds after which the envelope may be promoted.
    pub ready_at: i64,
    pub envelope: Envelope,
}

/// Terminal record of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Unix timestamp in milliseconds.
    pub failed_at: i64,
    /// Final error message.
    pub error: String,
}

impl DeadLetter {
    /// Serialize the dead letter to JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a dead letter from JSON.
    pub fn decode(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email() -> Envelope {
        Envelope::new(JobId::new(), "email", json!({"to": "a@b.com"}))
    }

    #[test]
    fn test_envelope_creation() {
        let env = email();
        assert_eq!(env.retry_count, 0);
        assert_eq!(env.attempt(), 1);
        assert!(env.last_error.is_none());
    }

    #[test]
    fn test_envelope_wire_format() {
        let env = email();
        let parsed: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();

        assert_eq!(parsed["jobId"], env.job_id.to_string());
        assert_eq!(parsed["type"], "email");
        assert_eq!(parsed["payload"]["to"], "a@b.com");
        assert_eq!(parsed["retryCount"], 0);
        assert!(parsed.get("lastError").is_none());
    }

    #[test]
    fn test_envelope_decode_without_retry_metadata() {
        let id = JobId::new();
        let raw = format!(r#"{{"jobId":"{}","type":"report","payload":{{"n":1}}}}"#, id);
        let env = Envelope::decode(&raw).unwrap();

        assert_eq!(env.job_id, id);
        assert_eq!(env.job_type, "report");
        assert_eq!(env.retry_count, 0);
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"type":"x","payload":{}}"#).is_err());
    }

    #[test]
    fn test_next_attempt_leaves_original_untouched() {
        let first = email();
        let second = first.next_attempt("smtp timeout");

        assert_eq!(first.retry_count, 0);
        assert!(first.last_error.is_none());
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.last_error.as_deref(), Some("smtp timeout"));
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.payload, first.payload);
    }

    #[test]
    fn test_dead_letter_flattens_envelope() {
        let dead = DeadLetter {
            envelope: email().next_attempt("boom"),
            failed_at: 1_700_000_000_000,
            error: "boom".to_string(),
        };
        let parsed: serde_json::Value = serde_json::from_str(&dead.encode().unwrap()).unwrap();

        assert_eq!(parsed["type"], "email");
        assert_eq!(parsed["retryCount"], 1);
        assert_eq!(parsed["failedAt"], 1_700_000_000_000i64);
        assert_eq!(parsed["error"], "boom");

        let back = DeadLetter::decode(&dead.encode().unwrap()).unwrap();
        assert_eq!(back, dead);
    }

    #[test]
    fn test_job_id_parse_and_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_id_serializes_as_plain_string() {
        let id = JobId::new();
        assert_eq!(serde_json::to_string(&id).unwrap(), format!("\"{}\"", id));
    }

    #[test]
    fn test_entry_id_ordering() {
        let a = EntryId::from("1-0");
        let b = EntryId::from("2-0");
        assert!(a < b);
        assert_eq!(a.to_string(), "1-0");
    }

    #[test]
    fn test_now_millis_is_reasonable() {
        // After 2020-01-01 in milliseconds.
        assert!(now_millis() > 1_577_836_800_000);
    }
}
