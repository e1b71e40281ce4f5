//! In-process transport
//!
//! Queues are FIFO buffers shared by competing consumers. Exchanges route by
//! exact routing key (`Direct`) or to every bound queue (`Fanout`); the
//! default exchange (`""`) routes to the queue named by the routing key and
//! creates it on first use.

use super::{DeliveryHandler, ExchangeKind, QueueTransport};
use crate::context::ShutdownSignal;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    available: Notify,
}

impl MemoryQueue {
    fn push(&self, body: Vec<u8>) {
        lock(&self.messages).push_back(body);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Vec<u8>> {
        let mut messages = lock(&self.messages);
        let body = messages.pop_front();
        // Pass the wakeup on so idle consumers pick up the rest.
        if !messages.is_empty() {
            self.available.notify_one();
        }
        body
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        lock(&self.messages).iter().cloned().collect()
    }
}

struct Exchange {
    kind: ExchangeKind,
    /// (routing key, queue)
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Topology {
    queues: HashMap<String, Arc<MemoryQueue>>,
    exchanges: HashMap<String, Exchange>,
}

impl Topology {
    fn queue(&mut self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::default()))
            .clone()
    }
}

/// In-memory [`QueueTransport`].
///
/// Keeps delivery counters so callers can observe what went through it.
pub struct MemoryTransport {
    topology: Mutex<Topology>,
    closed: watch::Sender<bool>,
    published: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            topology: Mutex::new(Topology::default()),
            closed,
            published: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Messages waiting in `queue` (0 for unknown queues)
    pub fn queue_len(&self, queue: &str) -> usize {
        lock(&self.topology)
            .queues
            .get(queue)
            .map_or(0, |q| q.len())
    }

    /// Copy of the messages waiting in `queue`, oldest first
    pub fn pending_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.topology)
            .queues
            .get(queue)
            .map(|q| q.snapshot())
            .unwrap_or_default()
    }

    /// Successful `publish` calls, including unroutable ones
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let targets = {
            let mut topology = lock(&self.topology);
            if exchange.is_empty() {
                vec![topology.queue(routing_key)]
            } else {
                let ex = topology
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;
                ex.bindings
                    .iter()
                    .filter(|(key, _)| ex.kind == ExchangeKind::Fanout || key == routing_key)
                    .filter_map(|(_, queue)| topology.queues.get(queue).cloned())
                    .collect()
            }
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "No queue bound for routing key, message discarded");
        }
        for queue in targets {
            queue.push(body.to_vec());
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.topology).queue(name);
        debug!(queue = name, "Queue declared");
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(TransportError::Declare(
                "The default exchange cannot be redeclared".to_string(),
            ));
        }

        let mut topology = lock(&self.topology);
        match topology.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::Declare(format!(
                "Exchange '{name}' already declared as {}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                topology.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = name, kind = %kind, "Exchange declared");
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let mut topology = lock(&self.topology);
        if !topology.queues.contains_key(queue) {
            return Err(TransportError::Declare(format!("Queue not found: {queue}")));
        }
        let ex = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;

        let binding = (routing_key.to_string(), queue.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        debug!(queue, exchange, routing_key, "Queue bound");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        shutdown: ShutdownSignal,
        handler: &dyn DeliveryHandler,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let source = lock(&self.topology).queue(queue);
        let mut closed = self.closed.subscribe();

        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }
            if *closed.borrow() {
                return Err(TransportError::Closed);
            }

            let Some(body) = source.pop() else {
                tokio::select! {
                    _ = source.available.notified() => {}
                    _ = shutdown.triggered() => return Ok(()),
                    _ = closed.wait_for(|&c| c) => return Err(TransportError::Closed),
                }
                continue;
            };

            match handler.on_message(&body).await {
                Ok(()) => {
                    self.acked.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(queue, error = %e, "Delivery rejected, requeueing");
                    self.rejected.fetch_add(1, Ordering::SeqCst);
                    source.push(body);
                }
            }
        }
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_replace(true);
        info!("Memory transport closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::shutdown_channel;
    use crate::transport::DeliveryRejected;
    use std::time::Duration;

    /// Records bodies; rejects the first `reject_first` deliveries.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
        reject_first: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn on_message(&self, body: &[u8]) -> Result<(), DeliveryRejected> {
            lock(&self.seen).push(body.to_vec());
            let remaining = self.reject_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.reject_first.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryRejected("not yet".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let transport = MemoryTransport::new();
        transport.publish("", "jobs", b"one").await.unwrap();
        transport.publish("", "jobs", b"two").await.unwrap();
        transport.publish("", "other", b"three").await.unwrap();

        assert_eq!(transport.queue_len("jobs"), 2);
        assert_eq!(transport.queue_len("other"), 1);
        assert_eq!(transport.published_count(), 3);
        assert_eq!(
            transport.pending_messages("jobs"),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_direct_exchange_routing() {
        let transport = MemoryTransport::new();
        transport.declare_queue("jobs", true).await.unwrap();
        transport.declare_queue("audit", true).await.unwrap();
        transport
            .declare_exchange("app", ExchangeKind::Direct, true)
            .await
            .unwrap();
        transport.bind_queue("jobs", "app", "jobs").await.unwrap();
        transport.bind_queue("audit", "app", "audit").await.unwrap();

        transport.publish("app", "jobs", b"x").await.unwrap();
        transport.publish("app", "nowhere", b"y").await.unwrap();

        assert_eq!(transport.queue_len("jobs"), 1);
        assert_eq!(transport.queue_len("audit"), 0);
        assert_eq!(transport.published_count(), 2);
    }

    #[tokio::test]
    async fn test_fanout_exchange_routing() {
        let transport = MemoryTransport::new();
        transport.declare_queue("a", true).await.unwrap();
        transport.declare_queue("b", true).await.unwrap();
        transport
            .declare_exchange("events", ExchangeKind::Fanout, true)
            .await
            .unwrap();
        transport.bind_queue("a", "events", "").await.unwrap();
        transport.bind_queue("b", "events", "").await.unwrap();

        transport.publish("events", "anything", b"x").await.unwrap();

        assert_eq!(transport.queue_len("a"), 1);
        assert_eq!(transport.queue_len("b"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_binding_delivers_once() {
        let transport = MemoryTransport::new();
        transport.declare_queue("jobs", true).await.unwrap();
        transport
            .declare_exchange("app", ExchangeKind::Direct, true)
            .await
            .unwrap();
        transport.bind_queue("jobs", "app", "jobs").await.unwrap();
        transport.bind_queue("jobs", "app", "jobs").await.unwrap();

        transport.publish("app", "jobs", b"x").await.unwrap();
        assert_eq!(transport.queue_len("jobs"), 1);
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_an_error() {
        let transport = MemoryTransport::new();
        let err = transport.publish("missing", "jobs", b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::ExchangeNotFound(name) if name == "missing"));
        assert_eq!(transport.published_count(), 0);
    }

    #[tokio::test]
    async fn test_exchange_redeclare_with_other_kind_fails() {
        let transport = MemoryTransport::new();
        transport
            .declare_exchange("app", ExchangeKind::Direct, true)
            .await
            .unwrap();
        transport
            .declare_exchange("app", ExchangeKind::Direct, true)
            .await
            .unwrap();
        assert!(
            transport
                .declare_exchange("app", ExchangeKind::Fanout, true)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_bind_unknown_queue_fails() {
        let transport = MemoryTransport::new();
        transport
            .declare_exchange("app", ExchangeKind::Direct, true)
            .await
            .unwrap();
        assert!(transport.bind_queue("ghost", "app", "ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_consume_acks_and_stops_on_shutdown() {
        let transport = Arc::new(MemoryTransport::new());
        transport.publish("", "jobs", b"a").await.unwrap();
        transport.publish("", "jobs", b"b").await.unwrap();

        let (tx, signal) = shutdown_channel();
        let recorder = Arc::new(Recorder::default());
        let consumer = tokio::spawn({
            let transport = transport.clone();
            let recorder = recorder.clone();
            async move { transport.consume("jobs", signal, recorder.as_ref()).await }
        });

        while transport.acked_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send_replace(true);

        consumer.await.unwrap().unwrap();
        assert_eq!(*lock(&recorder.seen), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(transport.queue_len("jobs"), 0);
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_requeued() {
        let transport = Arc::new(MemoryTransport::new());
        transport.publish("", "jobs", b"retry-me").await.unwrap();

        let (tx, signal) = shutdown_channel();
        let recorder = Arc::new(Recorder {
            reject_first: AtomicUsize::new(1),
            ..Recorder::default()
        });
        let consumer = tokio::spawn({
            let transport = transport.clone();
            let recorder = recorder.clone();
            async move { transport.consume("jobs", signal, recorder.as_ref()).await }
        });

        while transport.acked_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send_replace(true);
        consumer.await.unwrap().unwrap();

        assert_eq!(transport.rejected_count(), 1);
        assert_eq!(lock(&recorder.seen).len(), 2);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, signal) = shutdown_channel();
        let recorder = Arc::new(Recorder::default());
        let consumer = tokio::spawn({
            let transport = transport.clone();
            let recorder = recorder.clone();
            async move { transport.consume("jobs", signal, recorder.as_ref()).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.publish("", "jobs", b"late").await.unwrap();

        while transport.acked_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send_replace(true);
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_consumers_and_rejects_operations() {
        let transport = Arc::new(MemoryTransport::new());
        let (_tx, signal) = shutdown_channel();
        let recorder = Arc::new(Recorder::default());
        let consumer = tokio::spawn({
            let transport = transport.clone();
            let recorder = recorder.clone();
            async move { transport.consume("jobs", signal, recorder.as_ref()).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.close().await.unwrap();

        let result = consumer.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(transport.is_closed());
        assert!(matches!(
            transport.publish("", "jobs", b"x").await,
            Err(TransportError::Closed)
        ));
    }
}
