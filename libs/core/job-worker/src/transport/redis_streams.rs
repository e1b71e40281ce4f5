//! Redis Streams transport
//!
//! Each queue is a stream consumed through one consumer group:
//!
//! - `declare_queue` → `XGROUP CREATE <queue> <group> 0 MKSTREAM`
//! - `publish` → `XADD <routing_key> MAXLEN ~ <n> * job <body>`
//! - `consume` → `XREADGROUP ... BLOCK` + `XACK`, claiming entries that other
//!   consumers left pending for too long
//!
//! Redis has no exchanges: the routing key names the stream, and exchange
//! declarations and bindings are accepted without doing anything.

use super::{DeliveryHandler, ExchangeKind, QueueTransport};
use crate::context::ShutdownSignal;
use crate::error::TransportError;
use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_CONSUMER_GROUP: &str = "job_workers";
const PAYLOAD_FIELD: &str = "job";

type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;
type StreamReply = Option<Vec<(String, StreamEntries)>>;

struct Delivery {
    id: String,
    body: Option<Vec<u8>>,
}

impl Delivery {
    fn from_entries(entries: StreamEntries) -> Vec<Delivery> {
        entries
            .into_iter()
            .map(|(id, fields)| Delivery {
                id,
                body: fields
                    .into_iter()
                    .find(|(field, _)| field == PAYLOAD_FIELD)
                    .map(|(_, body)| body),
            })
            .collect()
    }
}

/// [`QueueTransport`] over Redis Streams consumer groups
pub struct RedisTransport {
    redis: ConnectionManager,
    consumer_group: String,
    consumer_prefix: String,
    max_length: i64,
    block_timeout: Duration,
    claim_timeout: Duration,
    closed: AtomicBool,
}

impl RedisTransport {
    /// Connect to `url` and wrap the connection in a transport
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        info!("Connected to Redis");
        Ok(Self::new(redis))
    }

    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_prefix: "worker".to_string(),
            max_length: 100_000,
            block_timeout: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(30 * 60),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the consumer group shared by every worker of a queue
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the prefix of per-loop consumer names (e.g. the pod name)
    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    /// Set the approximate maximum stream length
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set how long a read blocks, which bounds shutdown latency
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set how long an entry may stay unacknowledged before another consumer
    /// claims it. Keep this above the handler timeout.
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    fn conn(&self) -> Result<ConnectionManager, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.redis.clone())
    }

    async fn create_group(&self, stream: &str) -> Result<(), TransportError> {
        let mut conn = self.conn()?;

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream, group = %self.consumer_group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream, group = %self.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(TransportError::Redis(e)),
        }
    }

    async fn add(&self, stream: &str, body: &[u8]) -> Result<String, TransportError> {
        let mut conn = self.conn()?;

        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn read_new(&self, stream: &str, consumer: &str) -> Result<Vec<Delivery>, TransportError> {
        let mut conn = self.conn()?;

        let result: RedisResult<StreamReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.consumer_group)
            .arg(consumer)
            .arg("BLOCK")
            .arg(self.block_timeout.as_millis() as u64)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(streams)) => Ok(streams
                .into_iter()
                .flat_map(|(_, entries)| Delivery::from_entries(entries))
                .collect()),
            Ok(None) => Ok(Vec::new()),
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!(stream, "Consumer group missing, recreating");
                self.create_group(stream).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::Redis(e)),
        }
    }

    /// Take over entries another consumer received but never acknowledged
    async fn claim_abandoned(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Vec<Delivery>, TransportError> {
        let mut conn = self.conn()?;

        let pending: RedisResult<Vec<(String, String, i64, i64)>> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(&self.consumer_group)
            .arg("IDLE")
            .arg(self.claim_timeout.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(10)
            .query_async(&mut conn)
            .await;

        let ids: Vec<String> = match pending {
            Ok(entries) => entries.into_iter().map(|(id, _, _, _)| id).collect(),
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(Vec::new()),
            Err(e) => return Err(TransportError::Redis(e)),
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(&self.consumer_group)
            .arg(consumer)
            .arg(self.claim_timeout.as_millis() as u64);
        for id in &ids {
            cmd.arg(id);
        }

        let entries: StreamEntries = cmd.query_async(&mut conn).await?;
        let claimed = Delivery::from_entries(entries);
        if !claimed.is_empty() {
            warn!(stream, count = claimed.len(), "Claimed abandoned messages");
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, id: &str) -> Result<(), TransportError> {
        let mut conn = self.conn()?;

        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.consumer_group)
            .arg(id)
            .query_async(&mut conn)
            .await?;

        debug!(stream, stream_id = id, "Acknowledged message");
        Ok(())
    }

    async fn deliver(
        &self,
        stream: &str,
        delivery: Delivery,
        handler: &dyn DeliveryHandler,
    ) -> Result<(), TransportError> {
        let Some(body) = delivery.body else {
            warn!(stream, stream_id = %delivery.id, "Entry has no job field, acknowledging");
            return self.ack(stream, &delivery.id).await;
        };

        if let Err(e) = handler.on_message(&body).await {
            warn!(stream, stream_id = %delivery.id, error = %e, "Delivery rejected, requeueing");
            self.add(stream, &body).await?;
        }
        self.ack(stream, &delivery.id).await
    }
}

#[async_trait]
impl QueueTransport for RedisTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), TransportError> {
        if !exchange.is_empty() {
            debug!(exchange, routing_key, "Redis has no exchanges, publishing to stream");
        }
        let id = self.add(routing_key, body).await?;
        debug!(stream = routing_key, stream_id = %id, "Published message");
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<(), TransportError> {
        self.create_group(name).await
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), TransportError> {
        self.conn()?;
        debug!(exchange = name, kind = %kind, "Exchange declaration ignored by Redis transport");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.conn()?;
        debug!(queue, exchange, routing_key, "Queue binding ignored by Redis transport");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        shutdown: ShutdownSignal,
        handler: &dyn DeliveryHandler,
    ) -> Result<(), TransportError> {
        let consumer = format!("{}-{}", self.consumer_prefix, Uuid::new_v4());
        debug!(stream = queue, consumer = %consumer, "Consumer started");

        let mut claim_due = true;
        while !shutdown.is_triggered() {
            let deliveries = if claim_due {
                claim_due = false;
                self.claim_abandoned(queue, &consumer).await?
            } else {
                let deliveries = self.read_new(queue, &consumer).await?;
                // Look for abandoned entries whenever the stream goes idle
                claim_due = deliveries.is_empty();
                deliveries
            };

            for delivery in deliveries {
                self.deliver(queue, delivery, handler).await?;
            }
        }

        debug!(stream = queue, consumer = %consumer, "Consumer stopped");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        info!("Redis transport closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
