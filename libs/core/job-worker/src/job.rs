//! The job envelope
//!
//! A `Job` is the unit that travels over the queue. It carries a type used
//! for routing to a handler, an opaque JSON payload, and the retry
//! bookkeeping (`attempts` / `max_retry`).
//!
//! Wire format (JSON object):
//!
//! ```json
//! {
//!   "id": "5b0f...",
//!   "type": "email.send",
//!   "payload": {"to": "a@b.c", "subject": "hi"},
//!   "attempts": 0,
//!   "max_retry": 3,
//!   "created_at": "2026-01-01T00:00:00Z"
//! }
//! ```
//!
//! Only `type` is required when decoding; missing fields take their zero
//! value, except `max_retry` which defaults to 3.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry budget applied by [`Job::new`]
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Well-known job types
pub mod types {
    pub const EMAIL_SEND: &str = "email.send";
    pub const AUDIT_CLEANUP: &str = "audit.cleanup";
    pub const NOTIFICATION_SEND: &str = "notification.send";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    attempts: u32,
    #[serde(default = "default_max_retry")]
    max_retry: u32,
    #[serde(default)]
    created_at: DateTime<Utc>,
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

impl Job {
    /// Create a job with the default retry budget.
    ///
    /// The payload is serialized immediately, so a payload that cannot be
    /// represented as JSON fails here rather than at publish time.
    pub fn new<T>(job_type: impl Into<String>, payload: &T) -> Result<Self, JobError>
    where
        T: Serialize + ?Sized,
    {
        Self::with_max_retry(job_type, payload, DEFAULT_MAX_RETRY)
    }

    /// Create a job with an explicit retry budget. `max_retry` counts total
    /// handler invocations, so 0 and 1 both mean "run once".
    pub fn with_max_retry<T>(
        job_type: impl Into<String>,
        payload: &T,
        max_retry: u32,
    ) -> Result<Self, JobError>
    where
        T: Serialize + ?Sized,
    {
        let job_type = job_type.into();
        if job_type.is_empty() {
            return Err(JobError::EmptyType);
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            job_type,
            payload: serde_json::to_value(payload).map_err(JobError::Encoding)?,
            attempts: 0,
            max_retry,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serialize the envelope for the wire
    pub fn encode(&self) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec(self).map_err(JobError::Encoding)
    }

    /// Parse an envelope received from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self, JobError> {
        let job: Job = serde_json::from_slice(bytes).map_err(JobError::Decoding)?;
        if job.job_type.is_empty() {
            return Err(JobError::EmptyType);
        }
        Ok(job)
    }

    /// Decode the payload into the handler's expected shape
    pub fn unmarshal_payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        T::deserialize(&self.payload).map_err(JobError::Decoding)
    }

    /// Whether another invocation is permitted after the current one
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_retry
    }

    /// Record that a handler invocation is about to happen
    pub fn increment_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}
