use std::{collections::BTreeMap, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::queue::QueueClient,
    models::{
        health::{ComponentHealth, HealthReport},
        message::QueueNames,
    },
};

pub const BROKER_COMPONENT: &str = "message_broker";
pub const DEAD_LETTER_COMPONENT: &str = "dead_letter_queue";

/// Checks the broker link and the dead letter backlog of one queue family.
pub struct HealthChecker {
    client: QueueClient,
    queues: QueueNames,
}

impl HealthChecker {
    pub fn new(client: QueueClient, queues: QueueNames) -> Self {
        Self { client, queues }
    }

    pub async fn check_all(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        components.insert(BROKER_COMPONENT.to_string(), self.check_broker().await);
        components.insert(DEAD_LETTER_COMPONENT.to_string(), self.check_dead_letters().await);

        HealthReport::from_components(components)
    }

    async fn check_broker(&self) -> ComponentHealth {
        if !self.client.is_connected() {
            warn!("Broker connection lost");
            return ComponentHealth::unreachable(
                "Connection lost; it is not re-established automatically, restart the worker",
            );
        }

        let start = Instant::now();

        match self.client.queue_length(&self.queues.primary).await {
            Ok(length) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                debug!(latency_ms, "Broker health check passed");
                ComponentHealth::reachable(
                    latency_ms,
                    format!("{} messages pending on {}", length, self.queues.primary),
                )
            }
            Err(e) => {
                warn!(error = %e, "Broker health check failed");
                ComponentHealth::unreachable(format!("Queue lookup failed: {}", e))
            }
        }
    }

    async fn check_dead_letters(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.client.queue_length(&self.queues.dead).await {
            Ok(0) => ComponentHealth::reachable(start.elapsed().as_millis() as u64, "empty"),
            Ok(length) => {
                debug!(dead_letters = length, "Dead letter queue is not empty");
                ComponentHealth::backlog(
                    start.elapsed().as_millis() as u64,
                    format!("{} dead-lettered messages awaiting inspection", length),
                )
            }
            Err(e) => ComponentHealth::unreachable(format!("Queue lookup failed: {}", e)),
        }
    }
}
