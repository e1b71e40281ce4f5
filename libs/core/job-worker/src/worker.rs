//! The job worker: a fixed pool of consumption loops over one queue.
//!
//! Lifecycle: `Created` → `start()` → `Running` → `shutdown()` →
//! `ShuttingDown` → `Stopped`.
//!
//! Every delivery is acknowledged. Failures are handled by republishing the
//! job (attempt counter incremented) after a quadratic backoff until its
//! retry budget is spent; the broker's own redelivery is never used.

use crate::config::WorkerConfig;
use crate::context::{JobContext, ShutdownSignal, shutdown_channel};
use crate::error::{HandlerError, WorkerError};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::job::Job;
use crate::metrics::JobMetrics;
use crate::publisher::Publisher;
use crate::retry::quadratic_backoff;
use crate::transport::{DeliveryHandler, DeliveryRejected, ExchangeKind, QueueTransport};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Stopped => "stopped",
        };
        write!(f, "{state}")
    }
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub queue: String,
    pub exchange: String,
    pub concurrency: usize,
    pub handlers: Vec<String>,
    pub state: WorkerState,
    /// Retries waiting on their backoff or their publish
    pub pending_retries: usize,
    /// Jobs that failed on their last allowed attempt
    pub abandoned_jobs: u64,
}

/// State shared between the worker handle, its loops and its retry tasks
struct WorkerInner {
    transport: Arc<dyn QueueTransport>,
    registry: HandlerRegistry,
    publisher: Publisher,
    config: WorkerConfig,
    metrics: JobMetrics,
    shutdown: ShutdownSignal,
    state: Mutex<WorkerState>,
    retries: Mutex<JoinSet<()>>,
    abandoned: AtomicU64,
}

/// Background job worker.
///
/// # Example
///
/// ```rust,ignore
/// let transport: Arc<dyn QueueTransport> = Arc::new(RedisTransport::connect(&url).await?);
/// let worker = Worker::new(transport, WorkerConfig::new("jobs").with_concurrency(4));
///
/// worker.register_handler(EmailHandler::new(sender));
/// worker.start().await?;
///
/// shutdown_signal().await;
/// worker.shutdown(Duration::from_secs(30)).await?;
/// ```
pub struct Worker {
    inner: Arc<WorkerInner>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(transport: Arc<dyn QueueTransport>, config: WorkerConfig) -> Self {
        let config = config.normalized();
        let (shutdown_tx, shutdown) = shutdown_channel();

        let inner = WorkerInner {
            publisher: Publisher::from_config(transport.clone(), &config),
            metrics: JobMetrics::new(config.queue_name.clone()),
            transport,
            registry: HandlerRegistry::new(),
            config,
            shutdown,
            state: Mutex::new(WorkerState::Created),
            retries: Mutex::new(JoinSet::new()),
            abandoned: AtomicU64::new(0),
        };

        Self {
            inner: Arc::new(inner),
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler under its job type, replacing any earlier one.
    ///
    /// Meant to be called before `start()`; later registrations still take
    /// effect for subsequent deliveries.
    pub fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        self.register_shared(Arc::new(handler));
    }

    pub fn register_shared(&self, handler: Arc<dyn JobHandler>) {
        let state = self.state();
        if state != WorkerState::Created {
            warn!(
                job_type = %handler.job_type(),
                state = %state,
                "Registering handler on a worker that is already started"
            );
        }
        self.inner.registry.register(handler);
    }

    /// Declare the queue (and exchange binding, if configured) and launch
    /// the consumption loops.
    ///
    /// Declarations are best effort; only an unreachable transport fails
    /// startup, and the worker may then be started again.
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.state() != WorkerState::Created {
            return Err(WorkerError::AlreadyStarted);
        }

        let config = &self.inner.config;
        let transport = &self.inner.transport;

        info!(
            queue = %config.queue_name,
            exchange = %config.exchange,
            concurrency = config.concurrency,
            transport = transport.name(),
            handlers = ?self.inner.registry.job_types(),
            "Starting job worker"
        );

        if let Err(e) = transport.declare_queue(&config.queue_name, true).await {
            if e.is_connection_failure() {
                return Err(e.into());
            }
            warn!(queue = %config.queue_name, error = %e, "Failed to declare queue (may already exist)");
        }

        if !config.exchange.is_empty() {
            if let Err(e) = transport
                .declare_exchange(&config.exchange, ExchangeKind::Direct, true)
                .await
            {
                warn!(exchange = %config.exchange, error = %e, "Failed to declare exchange");
            }
            if let Err(e) = transport
                .bind_queue(&config.queue_name, &config.exchange, &config.queue_name)
                .await
            {
                warn!(
                    queue = %config.queue_name,
                    exchange = %config.exchange,
                    error = %e,
                    "Failed to bind queue"
                );
            }
        }

        {
            let mut state = lock(&self.inner.state);
            if *state != WorkerState::Created {
                return Err(WorkerError::AlreadyStarted);
            }
            *state = WorkerState::Running;
        }

        let mut loops = lock(&self.loops);
        for worker_id in 0..config.concurrency {
            let inner = self.inner.clone();
            loops.push(tokio::spawn(async move { inner.consume(worker_id).await }));
        }

        info!(queue = %config.queue_name, "Job worker started");
        Ok(())
    }

    /// Stop the worker, waiting at most `deadline` for in-flight jobs and
    /// pending retries.
    ///
    /// No new deliveries are taken once this is called. Pending retries are
    /// published immediately instead of waiting out their backoff. On timeout
    /// the remaining work is left running in the background and
    /// `ShutdownTimeout` is returned.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), WorkerError> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                WorkerState::Created => {
                    *state = WorkerState::Stopped;
                    info!("Job worker stopped before it was started");
                    return Ok(());
                }
                WorkerState::ShuttingDown | WorkerState::Stopped => {
                    debug!(state = %*state, "Shutdown already requested");
                    return Ok(());
                }
                WorkerState::Running => *state = WorkerState::ShuttingDown,
            }
        }

        info!(
            deadline_ms = deadline.as_millis() as u64,
            "Shutting down job worker"
        );
        self.shutdown_tx.send_replace(true);

        let loops = std::mem::take(&mut *lock(&self.loops));
        let mut retries: Option<JoinSet<()>> = None;

        let drained = tokio::time::timeout(deadline, async {
            for (worker_id, joined) in futures::future::join_all(loops).await.into_iter().enumerate() {
                if let Err(e) = joined {
                    error!(worker_id, error = %e, "Consumption loop terminated abnormally");
                }
            }
            // Loops are done, so no further retries can be scheduled.
            let pending = retries.insert(std::mem::take(&mut *lock(&self.inner.retries)));
            while pending.join_next().await.is_some() {}
        })
        .await;

        // Dropping a JoinSet aborts its tasks; leave stragglers running.
        if let Some(mut pending) = retries {
            pending.detach_all();
        }
        lock(&self.inner.retries).detach_all();

        *lock(&self.inner.state) = WorkerState::Stopped;

        match drained {
            Ok(()) => {
                info!("Job worker shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "Job worker shutdown timed out, abandoning in-flight work"
                );
                Err(WorkerError::ShutdownTimeout(deadline))
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.inner.state)
    }

    pub fn stats(&self) -> WorkerStats {
        let pending_retries = {
            let mut retries = lock(&self.inner.retries);
            while retries.try_join_next().is_some() {}
            retries.len()
        };

        WorkerStats {
            queue: self.inner.config.queue_name.clone(),
            exchange: self.inner.config.exchange.clone(),
            concurrency: self.inner.config.concurrency,
            handlers: self.inner.registry.job_types(),
            state: self.state(),
            pending_retries,
            abandoned_jobs: self.inner.abandoned.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Publisher bound to this worker's queue and exchange
    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }
}

impl WorkerInner {
    async fn consume(self: Arc<Self>, worker_id: usize) {
        let queue = self.config.queue_name.clone();
        info!(worker_id, queue = %queue, "Consumption loop started");

        let dispatcher = Dispatcher {
            worker_id,
            inner: self.clone(),
        };
        if let Err(e) = self
            .transport
            .consume(&queue, self.shutdown.clone(), &dispatcher)
            .await
        {
            error!(worker_id, queue = %queue, error = %e, "Consumer error, loop exiting");
        }

        info!(worker_id, queue = %queue, "Consumption loop stopped");
    }

    async fn process(&self, worker_id: usize, body: &[u8]) {
        self.metrics.job_received();

        let mut job = match Job::decode(body) {
            Ok(job) => job,
            Err(e) => {
                error!(worker_id, error = %e, "Failed to decode job, dropping message");
                self.metrics.job_dropped("decode");
                return;
            }
        };
        job.increment_attempts();

        info!(
            job_id = %job.id(),
            job_type = %job.job_type(),
            attempt = job.attempts(),
            max_retry = job.max_retry(),
            worker_id,
            "Processing job"
        );

        let Some(handler) = self.registry.lookup(job.job_type()) else {
            error!(
                job_id = %job.id(),
                job_type = %job.job_type(),
                worker_id,
                "No handler registered for job type, dropping job"
            );
            self.metrics.job_dropped("unroutable");
            return;
        };

        let timeout = self.config.handler_timeout;
        let ctx = JobContext::new(worker_id, job.attempts(), timeout, self.shutdown.clone());
        let started = Instant::now();

        let result = match tokio::time::timeout(
            timeout,
            AssertUnwindSafe(handler.handle(&ctx, &job)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(HandlerError::DeadlineExceeded(timeout)),
        };
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                info!(
                    job_id = %job.id(),
                    job_type = %job.job_type(),
                    attempt = job.attempts(),
                    duration_ms = duration.as_millis() as u64,
                    worker_id,
                    "Job completed"
                );
                self.metrics.job_succeeded(job.job_type(), duration);
            }
            Err(e) => {
                error!(
                    job_id = %job.id(),
                    job_type = %job.job_type(),
                    attempt = job.attempts(),
                    duration_ms = duration.as_millis() as u64,
                    worker_id,
                    error = %e,
                    "Job failed"
                );
                self.metrics.job_failed(job.job_type(), duration);

                if job.can_retry() {
                    self.schedule_retry(job);
                } else {
                    error!(
                        job_id = %job.id(),
                        job_type = %job.job_type(),
                        attempts = job.attempts(),
                        max_retry = job.max_retry(),
                        "Job exhausted its retries, abandoning"
                    );
                    self.metrics.job_abandoned(job.job_type());
                    self.abandoned.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Republish `job` after its backoff, or right away once shutdown begins.
    fn schedule_retry(&self, job: Job) {
        let delay = quadratic_backoff(job.attempts(), self.config.backoff_unit);
        info!(
            job_id = %job.id(),
            job_type = %job.job_type(),
            attempt = job.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling job retry"
        );
        self.metrics.job_retried(job.job_type());

        let publisher = self.publisher.clone();
        let shutdown = self.shutdown.clone();

        let mut retries = lock(&self.retries);
        while retries.try_join_next().is_some() {}
        retries.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.triggered() => {
                    debug!(job_id = %job.id(), "Shutting down, publishing retry without waiting");
                }
            }

            if let Err(e) = publisher.publish_raw(&job).await {
                error!(
                    job_id = %job.id(),
                    job_type = %job.job_type(),
                    attempt = job.attempts(),
                    error = %e,
                    "Failed to republish job for retry"
                );
            }
        });
    }
}

/// Adapts the worker to the transport's delivery callback
struct Dispatcher {
    worker_id: usize,
    inner: Arc<WorkerInner>,
}

#[async_trait]
impl DeliveryHandler for Dispatcher {
    async fn on_message(&self, body: &[u8]) -> Result<(), DeliveryRejected> {
        // Outcomes are settled by republishing, so the delivery is always acked.
        self.inner.process(self.worker_id, body).await;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FailingHandler, NoOpHandler};
    use crate::transport::{MemoryTransport, NoopTransport};

    fn worker() -> Worker {
        Worker::new(Arc::new(NoopTransport), WorkerConfig::default())
    }

    #[tokio::test]
    async fn test_new_worker_is_created() {
        let worker = worker();
        assert_eq!(worker.state(), WorkerState::Created);
        assert_eq!(worker.publisher().queue_name(), "jobs");
    }

    #[tokio::test]
    async fn test_config_normalized_on_construction() {
        let config = WorkerConfig {
            queue_name: String::new(),
            concurrency: 0,
            ..WorkerConfig::default()
        };
        let worker = Worker::new(Arc::new(NoopTransport), config);
        assert_eq!(worker.config().queue_name, "jobs");
        assert_eq!(worker.config().concurrency, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let worker = worker();
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let worker = worker();
        worker.start().await.unwrap();
        assert!(matches!(
            worker.start().await,
            Err(WorkerError::AlreadyStarted)
        ));
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let worker = worker();
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            worker.start().await,
            Err(WorkerError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_repeated_shutdown_is_ok() {
        let worker = worker();
        worker.start().await.unwrap();
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_on_closed_transport() {
        let transport = Arc::new(MemoryTransport::new());
        transport.close().await.unwrap();

        let worker = Worker::new(transport, WorkerConfig::default());
        let err = worker.start().await.unwrap_err();

        assert!(matches!(err, WorkerError::Transport(_)));
        assert_eq!(worker.state(), WorkerState::Created);
    }

    #[tokio::test]
    async fn test_start_declares_exchange_binding() {
        let transport = Arc::new(MemoryTransport::new());
        let worker = Worker::new(
            transport.clone(),
            WorkerConfig::new("jobs").with_exchange("app"),
        );
        worker.start().await.unwrap();

        // Publishing through the exchange reaches the worker's queue.
        worker
            .publisher()
            .publish("unknown", &serde_json::json!({}))
            .await
            .unwrap();
        worker.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.published_count(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let worker = Worker::new(
            Arc::new(NoopTransport),
            WorkerConfig::new("mail").with_concurrency(3),
        );
        worker.register_handler(NoOpHandler::new("email.send"));
        worker.register_handler(FailingHandler::new("audit.cleanup", "boom"));

        let stats = worker.stats();
        assert_eq!(stats.queue, "mail");
        assert_eq!(stats.concurrency, 3);
        assert_eq!(stats.handlers, vec!["audit.cleanup", "email.send"]);
        assert_eq!(stats.state, WorkerState::Created);
        assert_eq!(stats.pending_retries, 0);
        assert_eq!(stats.abandoned_jobs, 0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::ShuttingDown.to_string(), "shutting_down");
    }
}
