//! Error types for the job worker
//!
//! - **JobError**: envelope or payload (de)serialization
//! - **HandlerError**: returned by handlers; any variant sends the job down the retry path
//! - **TransportError**: queue transport failures
//! - **WorkerError**: lifecycle and publish failures surfaced to callers

use std::time::Duration;
use thiserror::Error;

/// Envelope and payload (de)serialization errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to encode job: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("Failed to decode job: {0}")]
    Decoding(#[source] serde_json::Error),

    #[error("Job type must not be empty")]
    EmptyType,
}

/// Failure reported by a job handler
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The payload did not match the handler's expected schema
    #[error("Invalid payload: {0}")]
    Payload(#[from] JobError),

    /// The handler did not finish before its deadline
    #[error("Handler exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// The handler panicked; the panic was contained by the worker
    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Queue transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Declaration failed: {0}")]
    Declare(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Transport is closed")]
    Closed,

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl TransportError {
    /// Whether the transport itself is unreachable, as opposed to a single
    /// operation being refused.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            TransportError::Connection(_) | TransportError::Closed => true,
            #[cfg(feature = "redis")]
            TransportError::Redis(e) => {
                e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}

/// Errors surfaced by the worker and publisher
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Worker has already been started")]
    AlreadyStarted,

    #[error("Worker shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_constructors() {
        let err = HandlerError::failed("smtp unavailable");
        assert_eq!(err.to_string(), "smtp unavailable");

        let io = std::io::Error::other("connection reset");
        let err = HandlerError::with_source("send failed", io);
        assert_eq!(err.to_string(), "send failed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_handler_error_from_job_error() {
        let err: HandlerError = JobError::EmptyType.into();
        assert!(matches!(err, HandlerError::Payload(JobError::EmptyType)));
        assert!(err.to_string().contains("Invalid payload"));
    }

    #[test]
    fn test_connection_failure_classification() {
        assert!(TransportError::Closed.is_connection_failure());
        assert!(TransportError::Connection("refused".into()).is_connection_failure());
        assert!(!TransportError::ExchangeNotFound("jobs".into()).is_connection_failure());
        assert!(!TransportError::Declare("exists".into()).is_connection_failure());
    }

    #[test]
    fn test_shutdown_timeout_message() {
        let err = WorkerError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }
}
