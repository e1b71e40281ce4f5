//! Job handlers and the type → handler registry.

use crate::context::JobContext;
use crate::error::HandlerError;
use crate::job::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Executes jobs of a single type.
///
/// # Error Handling
///
/// Any `Err` sends the job down the retry path: it is republished with
/// quadratic backoff until its `max_retry` budget is spent, then abandoned.
/// Handlers should be idempotent, a job may be invoked more than once.
///
/// # Example
///
/// ```rust,ignore
/// use job_worker::{HandlerError, Job, JobContext, JobHandler};
/// use async_trait::async_trait;
///
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl JobHandler for ResizeHandler {
///     fn job_type(&self) -> &str {
///         "image.resize"
///     }
///
///     async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
///         let payload: ResizePayload = job.unmarshal_payload()?;
///         // ...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler is registered under
    fn job_type(&self) -> &str;

    async fn handle(&self, ctx: &JobContext, job: &Job) -> Result<(), HandlerError>;
}

/// Map from job type to its handler.
///
/// Registering a second handler for a type replaces the first.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if handlers.insert(job_type.clone(), handler).is_some() {
            warn!(job_type = %job_type, "Replaced existing job handler");
        } else {
            info!(job_type = %job_type, "Registered job handler");
        }
    }

    pub fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    /// Registered job types, sorted
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A handler that accepts every job (for testing).
#[derive(Debug, Clone)]
pub struct NoOpHandler {
    job_type: String,
}

impl NoOpHandler {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
        }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn handle(&self, _ctx: &JobContext, _job: &Job) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// A handler that always fails (for testing).
#[derive(Debug, Clone)]
pub struct FailingHandler {
    job_type: String,
    error_message: String,
}

impl FailingHandler {
    pub fn new(job_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            error_message: message.into(),
        }
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn handle(&self, _ctx: &JobContext, _job: &Job) -> Result<(), HandlerError> {
        Err(HandlerError::failed(&self.error_message))
    }
}
