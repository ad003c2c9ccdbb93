use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    clients::queue::{Acknowledger, Delivery, QueueBackend, Subscription},
    config::Config,
    error::{QueueError, Result},
    utils::retry_with_backoff,
};

const PERSISTENT: u8 = 2;
const FAIR_DISPATCH_PREFETCH: u16 = 1;
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ backend.
///
/// Publishing goes through one channel guarded by a mutex; every consumer gets a channel
/// of its own with prefetch 1. A connection lost mid-session is not re-established: the
/// consumer streams end and `is_connected` turns false, so the process has to be restarted.
pub struct RabbitMqClient {
    connection: Connection,
    publish_channel: Mutex<Channel>,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self> {
        let retry_config = config.connect_retry_config();

        info!(
            max_attempts = retry_config.max_attempts,
            interval_ms = retry_config.initial_delay_ms,
            "Connecting to RabbitMQ..."
        );

        let connection = retry_with_backoff(&retry_config, || {
            Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
        })
        .await
        .map_err(|e| {
            QueueError::Connection(format!(
                "Failed to connect to RabbitMQ after {} attempts: {}",
                retry_config.max_attempts, e
            ))
        })?;

        info!("RabbitMQ connection established");

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("RabbitMQ channel creation failed: {}", e)))?;

        debug!("RabbitMQ publish channel created");

        Ok(Self {
            connection,
            publish_channel: Mutex::new(publish_channel),
        })
    }

    async fn open_channel(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("RabbitMQ channel creation failed: {}", e)))
    }
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| QueueError::Declaration {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

    Ok(())
}

#[async_trait]
impl QueueBackend for RabbitMqClient {
    fn kind(&self) -> &'static str {
        "rabbitmq"
    }

    async fn declare(&self, queue: &str) -> Result<()> {
        let channel = self.publish_channel.lock().await;
        declare_durable(&channel, queue).await
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let channel = self.publish_channel.lock().await;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| QueueError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Subscription>> {
        let channel = self.open_channel().await?;

        channel
            .basic_qos(FAIR_DISPATCH_PREFETCH, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Consume {
                queue: queue.to_string(),
                reason: format!("Failed to set up QoS: {}", e),
            })?;

        declare_durable(&channel, queue).await?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume {
                queue: queue.to_string(),
                reason: format!("Failed to create consumer: {}", e),
            })?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer created for queue");

        Ok(Box::new(RabbitMqSubscription {
            channel,
            consumer,
            queue: queue.to_string(),
        }))
    }

    async fn queue_length(&self, queue: &str) -> Result<u64> {
        // A passive declare that fails closes its channel, so never use a shared one here.
        let channel = self.open_channel().await?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declaration {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = channel.close(REPLY_SUCCESS, "stats".into()).await {
            debug!(queue = %queue, error = %e, "Stats channel close failed");
        }

        Ok(declared.message_count() as u64)
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.is_connected() {
            warn!("RabbitMQ connection already closed");
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "shutdown".into())
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to close connection: {}", e)))?;

        info!("RabbitMQ connection closed");
        Ok(())
    }
}

struct RabbitMqSubscription {
    channel: Channel,
    consumer: Consumer,
    queue: String,
}

#[async_trait]
impl Subscription for RabbitMqSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let delivery = self.consumer.next().await?;

        Some(
            delivery
                .map(|delivery| {
                    let acker = RabbitMqAcker {
                        channel: self.channel.clone(),
                        delivery_tag: delivery.delivery_tag,
                    };
                    Delivery::new(delivery.data, delivery.redelivered, Box::new(acker))
                })
                .map_err(|e| QueueError::Consume {
                    queue: self.queue.clone(),
                    reason: e.to_string(),
                }),
        )
    }

    /// Closing the consumer's channel hands any unacknowledged message back to the queue.
    async fn cancel(&mut self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "consumer cancelled".into())
            .await
            .map_err(|e| QueueError::Consume {
                queue: self.queue.clone(),
                reason: format!("Failed to close consumer channel: {}", e),
            })?;

        Ok(())
    }
}

struct RabbitMqAcker {
    channel: Channel,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for RabbitMqAcker {
    async fn ack(&self) -> Result<()> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Acknowledge(format!("Failed to acknowledge message: {}", e)))?;

        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Acknowledge(format!("Failed to reject message: {}", e)))?;

        Ok(())
    }
}
