//! Job publisher
//!
//! Wraps a payload in a [`Job`] envelope and sends it to the configured
//! exchange with the queue name as routing key. The worker uses the same
//! path to re-enqueue retries.

use crate::config::{DEFAULT_QUEUE_NAME, WorkerConfig};
use crate::error::WorkerError;
use crate::job::{DEFAULT_MAX_RETRY, Job};
use crate::transport::QueueTransport;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn QueueTransport>,
    queue_name: String,
    exchange: String,
}

impl Publisher {
    /// Create a publisher; an empty queue name selects `"jobs"`
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        queue_name: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        let queue_name = queue_name.into();
        Self {
            transport,
            queue_name: if queue_name.is_empty() {
                DEFAULT_QUEUE_NAME.to_string()
            } else {
                queue_name
            },
            exchange: exchange.into(),
        }
    }

    /// Create a publisher targeting the same queue and exchange as a worker
    pub fn from_config(transport: Arc<dyn QueueTransport>, config: &WorkerConfig) -> Self {
        Self::new(transport, config.queue_name.clone(), config.exchange.clone())
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Enqueue a job with the default retry budget, returning its id
    pub async fn publish<T>(&self, job_type: &str, payload: &T) -> Result<String, WorkerError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish_with_retry(job_type, payload, DEFAULT_MAX_RETRY)
            .await
    }

    /// Enqueue a job with an explicit retry budget, returning its id
    pub async fn publish_with_retry<T>(
        &self,
        job_type: &str,
        payload: &T,
        max_retry: u32,
    ) -> Result<String, WorkerError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let job = Job::with_max_retry(job_type, payload, max_retry)?;
        self.publish_raw(&job).await?;
        Ok(job.id().to_string())
    }

    /// Send an existing envelope unchanged (attempt counter included)
    pub async fn publish_raw(&self, job: &Job) -> Result<(), WorkerError> {
        let body = job.encode()?;
        self.transport
            .publish(&self.exchange, &self.queue_name, &body)
            .await?;

        debug!(
            job_id = %job.id(),
            job_type = %job.job_type(),
            attempts = job.attempts(),
            queue = %self.queue_name,
            "Published job"
        );
        Ok(())
    }
}
