//! Queue transport abstraction
//!
//! The worker and publisher only talk to a broker through [`QueueTransport`].
//! Implementations:
//!
//! - [`MemoryTransport`]: in-process queues, for tests and single-binary setups
//! - [`RedisTransport`]: Redis Streams with one consumer group per queue
//! - [`NoopTransport`]: accepts everything, delivers nothing

mod memory;
mod noop;
#[cfg(feature = "redis")]
mod redis_streams;

pub use memory::MemoryTransport;
pub use noop::NoopTransport;
#[cfg(feature = "redis")]
pub use redis_streams::RedisTransport;

use crate::context::ShutdownSignal;
use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Deliver to queues bound with exactly the publish routing key
    Direct,
    /// Deliver to every bound queue, ignoring the routing key
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Returned by a [`DeliveryHandler`] to have the message requeued instead
/// of acknowledged.
#[derive(Error, Debug)]
#[error("Delivery rejected: {0}")]
pub struct DeliveryRejected(pub String);

/// Callback invoked for each message a transport delivers.
///
/// `Ok` acknowledges the message, `Err` returns it to the queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_message(&self, body: &[u8]) -> Result<(), DeliveryRejected>;
}

/// Minimal broker contract used by the worker and publisher
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Publish `body` to `exchange` with `routing_key`.
    ///
    /// An empty exchange is the default exchange, which routes straight to
    /// the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError>;

    /// Idempotently declare a queue
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), TransportError>;

    /// Idempotently declare an exchange
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    /// Bind `queue` to `exchange` for `routing_key`
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Deliver messages from `queue` to `handler` one at a time until
    /// `shutdown` fires.
    ///
    /// Returns `Ok` on shutdown and `Err` if the transport fails underneath
    /// the consumer. Several calls may consume the same queue concurrently;
    /// each message goes to exactly one of them.
    async fn consume(
        &self,
        queue: &str,
        shutdown: ShutdownSignal,
        handler: &dyn DeliveryHandler,
    ) -> Result<(), TransportError>;

    /// Check that the broker is reachable
    async fn health_check(&self) -> Result<(), TransportError>;

    /// Release connections; subsequent operations fail with `Closed`
    async fn close(&self) -> Result<(), TransportError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
