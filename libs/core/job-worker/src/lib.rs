//! Job Worker Framework
//!
//! Asynchronous background job processing over a message queue.
//!
//! ## Features
//!
//! - **Job envelope**: typed routing key, JSON payload, attempt bookkeeping
//! - **Handler registry**: one handler per job type, last registration wins
//! - **Bounded concurrency**: a fixed pool of consumption loops per worker
//! - **Retries**: failed jobs are republished after `attempts² × 1s` until
//!   their retry budget is spent
//! - **Graceful shutdown**: stop intake, drain in-flight work under a deadline
//! - **Pluggable transports**: in-memory, Redis Streams, no-op
//!
//! ## Example
//!
//! ```ignore
//! use job_worker::{Publisher, Worker, WorkerConfig, transport::RedisTransport};
//!
//! let transport = Arc::new(RedisTransport::connect("redis://localhost:6379").await?);
//! let config = WorkerConfig::new("jobs").with_concurrency(4);
//!
//! let worker = Worker::new(transport.clone(), config.clone());
//! worker.register_handler(MyHandler);
//! worker.start().await?;
//!
//! let publisher = Publisher::from_config(transport, &config);
//! publisher.publish("my.job", &payload).await?;
//!
//! worker.shutdown(Duration::from_secs(30)).await?;
//! ```

mod config;
mod context;
mod error;
mod handler;
mod job;
pub mod metrics;
mod publisher;
mod retry;
pub mod transport;
mod worker;

pub use config::{DEFAULT_HANDLER_TIMEOUT, DEFAULT_QUEUE_NAME, WorkerConfig};
pub use context::{JobContext, ShutdownSignal, shutdown_channel};
pub use error::{HandlerError, JobError, TransportError, WorkerError};
pub use handler::{FailingHandler, HandlerRegistry, JobHandler, NoOpHandler};
pub use job::{DEFAULT_MAX_RETRY, Job, types};
pub use crate::metrics::JobMetrics;
pub use publisher::Publisher;
pub use retry::{DEFAULT_BACKOFF_UNIT, quadratic_backoff};
pub use transport::{
    DeliveryHandler, DeliveryRejected, ExchangeKind, MemoryTransport, NoopTransport,
    QueueTransport,
};
pub use worker::{Worker, WorkerState, WorkerStats};

// Re-export for handler implementations
pub use async_trait::async_trait;
