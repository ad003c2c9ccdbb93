use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{QueueError, Result},
    models::{
        event::SecurityEvent,
        message::{Message, QueueNames},
        stats::QueueStats,
    },
};

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer. Dropping it unsettled leaves the message to the
/// broker, which redelivers it once the consumer's channel goes away.
pub struct Delivery {
    pub data: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(data: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            data,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

/// Stream of deliveries for one consumer with at most one unsettled message at a time.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the underlying stream has ended.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    async fn cancel(&mut self) -> Result<()>;
}

/// Capabilities the publisher, consumers and stats reporter need from a broker.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Ensures a durable queue exists. Redeclaring leaves enqueued messages untouched.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Enqueues a persistent record. Implementations serialize access to the shared
    /// publish channel.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Subscription>>;

    /// Messages ready for delivery. Must not create or alter the queue.
    async fn queue_length(&self, queue: &str) -> Result<u64>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// What happened to a message that could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedOutcome {
    Requeued,
    DeadLettered,
}

/// Handle shared by everything that talks to the broker. Cheap to clone.
#[derive(Clone)]
pub struct QueueClient {
    backend: Arc<dyn QueueBackend>,
}

impl QueueClient {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    pub async fn declare(&self, queue: &str) -> Result<()> {
        self.backend.declare(queue).await
    }

    pub async fn declare_all(&self, queues: &QueueNames) -> Result<()> {
        for queue in queues.all() {
            self.backend.declare(queue).await?;
        }

        debug!(queue = %queues.primary, "Queue family declared");
        Ok(())
    }

    pub async fn publish(&self, message: &Message, queue: &str) -> Result<()> {
        self.backend.declare(queue).await?;

        let body = serde_json::to_vec(message)?;
        self.backend.publish(queue, &body).await?;

        info!(
            message_id = %message.id,
            queue = %queue,
            retry_count = message.retry_count,
            "Message published"
        );
        Ok(())
    }

    pub async fn publish_event(&self, event: &SecurityEvent, queue: &str) -> Result<()> {
        let message = Message::from_event(event)?;
        self.publish(&message, queue).await
    }

    /// Copies an undecodable body verbatim.
    pub async fn publish_raw(&self, body: &[u8], queue: &str) -> Result<()> {
        self.backend.declare(queue).await?;
        self.backend.publish(queue, body).await
    }

    pub async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Subscription>> {
        self.backend.declare(queue).await?;
        self.backend.subscribe(queue, consumer_tag).await
    }

    /// Takes a single message off `queue`, acknowledging it on receipt.
    ///
    /// Returns `Ok(None)` when nothing arrives within `timeout`.
    pub async fn consume(&self, queue: &str, timeout: Duration) -> Result<Option<Message>> {
        let consumer_tag = format!("oneshot-{}", Uuid::new_v4());
        let mut subscription = self.subscribe(queue, &consumer_tag).await?;

        let received = tokio::time::timeout(timeout, subscription.next_delivery()).await;

        let result = match received {
            Err(_) => {
                debug!(queue = %queue, timeout_ms = timeout.as_millis() as u64, "No message before timeout");
                Ok(None)
            }
            Ok(None) => Err(QueueError::Closed),
            Ok(Some(Err(e))) => Err(e),
            Ok(Some(Ok(delivery))) => match serde_json::from_slice::<Message>(&delivery.data) {
                Ok(message) => {
                    delivery.ack().await?;
                    info!(message_id = %message.id, queue = %queue, "Message consumed");
                    Ok(Some(message))
                }
                Err(e) => {
                    let dead = QueueNames::owning(queue).dead;
                    self.reject_malformed(delivery, &dead).await?;
                    Err(QueueError::Consume {
                        queue: queue.to_string(),
                        reason: format!("malformed message: {}", e),
                    })
                }
            },
        };

        if let Err(e) = subscription.cancel().await {
            warn!(queue = %queue, error = %e, "Failed to cancel one-shot consumer");
        }

        result
    }

    /// Requeues an undecodable delivery once; a second sighting goes to `dead_queue`.
    pub async fn reject_malformed(&self, delivery: Delivery, dead_queue: &str) -> Result<MalformedOutcome> {
        if !delivery.redelivered {
            warn!(bytes = delivery.data.len(), "Malformed message, requeueing once");
            delivery.nack(true).await?;
            return Ok(MalformedOutcome::Requeued);
        }

        if let Err(e) = self.publish_raw(&delivery.data, dead_queue).await {
            warn!(error = %e, dead_queue = %dead_queue, "Could not quarantine malformed message");
            delivery.nack(true).await?;
            return Ok(MalformedOutcome::Requeued);
        }

        warn!(dead_queue = %dead_queue, "Malformed message redelivered, moved to dead letter queue");
        delivery.ack().await?;
        Ok(MalformedOutcome::DeadLettered)
    }

    pub async fn queue_length(&self, queue: &str) -> Result<u64> {
        self.backend.queue_length(queue).await
    }

    /// Depth per queue. A failed lookup is reported for that queue only.
    pub async fn stats(&self, queues: &[&str]) -> BTreeMap<String, QueueStats> {
        let mut stats = BTreeMap::new();

        for queue in queues {
            let entry = match self.backend.queue_length(queue).await {
                Ok(length) => QueueStats::Depth {
                    length,
                    backend_kind: self.backend.kind().to_string(),
                },
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Queue stats unavailable");
                    QueueStats::Unavailable {
                        error: e.to_string(),
                    }
                }
            };

            stats.insert(queue.to_string(), entry);
        }

        stats
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}
