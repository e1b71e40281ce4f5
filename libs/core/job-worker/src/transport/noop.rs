//! Transport for deployments with queueing disabled

use super::{DeliveryHandler, ExchangeKind, QueueTransport};
use crate::context::ShutdownSignal;
use crate::error::TransportError;
use async_trait::async_trait;
use tracing::debug;

/// Accepts every publish and declaration, never delivers anything.
///
/// `consume` parks until shutdown so a worker built on it idles cleanly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

impl NoopTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueueTransport for NoopTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _body: &[u8],
    ) -> Result<(), TransportError> {
        debug!(exchange, routing_key, "Queueing disabled, publish discarded");
        Ok(())
    }

    async fn declare_queue(&self, _name: &str, _durable: bool) -> Result<(), TransportError> {
        Ok(())
    }

    async fn declare_exchange(
        &self,
        _name: &str,
        _kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn bind_queue(
        &self,
        _queue: &str,
        _exchange: &str,
        _routing_key: &str,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        shutdown: ShutdownSignal,
        _handler: &dyn DeliveryHandler,
    ) -> Result<(), TransportError> {
        shutdown.triggered().await;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
