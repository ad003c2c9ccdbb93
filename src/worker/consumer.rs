use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    clients::queue::{Delivery, MalformedOutcome, QueueClient, Subscription},
    error::{ProcessingError, Result},
    models::message::{Message, QueueNames},
    worker::handler::HandlerRegistry,
};

/// Terminal decision taken for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acked,
    Retried { retry_count: u32 },
    DeadLettered { retry_count: u32 },
    /// Handed back to the broker: a malformed first sighting, or a failure we could not
    /// republish.
    Requeued,
    /// Undecodable body seen a second time, copied verbatim to the dead letter queue.
    Quarantined,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_retries: u32,
    pub handler_timeout: Duration,
    /// Pause before handing a message back when it could not be rerouted.
    pub requeue_delay: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            handler_timeout: Duration::from_secs(30),
            requeue_delay: Duration::from_secs(1),
        }
    }
}

/// One worker bound to a single source queue. Failures are routed to the satellites of
/// the queue family, never to satellites of the source itself.
///
/// If a satellite queue stays unwritable, the failed message is requeued after
/// `requeue_delay` and its handler runs again on every redelivery. The loop only ends
/// once the satellite accepts writes again.
pub struct Consumer {
    worker_id: usize,
    source: String,
    queues: QueueNames,
    client: QueueClient,
    handlers: Arc<HandlerRegistry>,
    settings: ConsumerSettings,
}

impl Consumer {
    pub fn new(
        worker_id: usize,
        source: impl Into<String>,
        client: QueueClient,
        handlers: Arc<HandlerRegistry>,
        settings: ConsumerSettings,
    ) -> Self {
        let source = source.into();

        Self {
            worker_id,
            queues: QueueNames::owning(&source),
            source,
            client,
            handlers,
            settings,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Declares the queue family and opens this worker's subscription on the source queue.
    pub async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        self.client.declare_all(&self.queues).await?;

        let consumer_tag = format!("worker-{}-{}", self.worker_id, self.source);
        self.client.subscribe(&self.source, &consumer_tag).await
    }

    /// Processes deliveries one at a time until `shutdown` flips to `true`, its sender
    /// is dropped, or the broker stream ends.
    pub async fn serve(
        self,
        mut subscription: Box<dyn Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(worker_id = self.worker_id, queue = %self.source, "Consumer worker started");

        let outcome = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                next = subscription.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = self.process(delivery).await {
                            error!(
                                worker_id = self.worker_id,
                                queue = %self.source,
                                error = %e,
                                "Failed to settle delivery"
                            );
                        }
                    }
                    Some(Err(e)) => {
                        error!(worker_id = self.worker_id, queue = %self.source, error = %e, "Consumer stream failed");
                        break Err(e);
                    }
                    None => {
                        warn!(
                            worker_id = self.worker_id,
                            queue = %self.source,
                            "Consumer stream ended; broker connection is not re-established automatically"
                        );
                        break Ok(());
                    }
                },
            }
        };

        if let Err(e) = subscription.cancel().await {
            debug!(worker_id = self.worker_id, error = %e, "Consumer cancel failed");
        }

        info!(worker_id = self.worker_id, queue = %self.source, "Consumer worker stopping");
        outcome
    }

    /// Runs the handler for one delivery and settles it.
    pub async fn process(&self, delivery: Delivery) -> Result<ProcessOutcome> {
        let message = match serde_json::from_slice::<Message>(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(worker_id = self.worker_id, queue = %self.source, error = %e, "Failed to decode message");
                return match self.client.reject_malformed(delivery, &self.queues.dead).await? {
                    MalformedOutcome::Requeued => Ok(ProcessOutcome::Requeued),
                    MalformedOutcome::DeadLettered => Ok(ProcessOutcome::Quarantined),
                };
            }
        };

        debug!(
            worker_id = self.worker_id,
            message_id = %message.id,
            message_type = %message.message_type,
            retry_count = message.retry_count,
            "Processing message"
        );

        let handler = self.handlers.resolve(&message.message_type);
        let result = match tokio::time::timeout(self.settings.handler_timeout, handler.handle(&message)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::Timeout(self.settings.handler_timeout.as_millis() as u64)),
        };

        match result {
            Ok(()) => {
                delivery.ack().await?;
                debug!(worker_id = self.worker_id, message_id = %message.id, "Message acknowledged");
                Ok(ProcessOutcome::Acked)
            }
            Err(e) => self.handle_failure(delivery, &message, e).await,
        }
    }

    async fn handle_failure(
        &self,
        delivery: Delivery,
        message: &Message,
        cause: ProcessingError,
    ) -> Result<ProcessOutcome> {
        let failed = message.next_attempt();
        let retry_count = failed.retry_count;

        let (target, outcome) = if retry_count < self.settings.max_retries {
            (&self.queues.retry, ProcessOutcome::Retried { retry_count })
        } else {
            (&self.queues.dead, ProcessOutcome::DeadLettered { retry_count })
        };

        if let Err(e) = self.client.publish(&failed, target).await {
            error!(
                worker_id = self.worker_id,
                message_id = %message.id,
                target = %target,
                error = %e,
                retryable = e.is_retryable(),
                "Failed to reroute failed message, requeueing original"
            );
            tokio::time::sleep(self.settings.requeue_delay).await;
            delivery.nack(true).await?;
            return Ok(ProcessOutcome::Requeued);
        }

        delivery.ack().await?;

        match outcome {
            ProcessOutcome::DeadLettered { .. } => error!(
                worker_id = self.worker_id,
                message_id = %message.id,
                retry_count,
                error = %cause,
                "Message exceeded max retries, moved to dead letter queue"
            ),
            _ => warn!(
                worker_id = self.worker_id,
                message_id = %message.id,
                retry_count,
                error = %cause,
                "Message processing failed, scheduled for retry"
            ),
        }

        Ok(outcome)
    }
}
