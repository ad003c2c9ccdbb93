//! In-process broker with the same delivery semantics as the RabbitMQ backend:
//! explicit ack/nack, requeue on abandonment, redelivery flag, ready-only depth.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    clients::queue::{Acknowledger, Delivery, QueueBackend, Subscription},
    error::{QueueError, Result},
    models::message::Message,
};

#[derive(Debug, Clone)]
struct Pending {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    unacked: HashMap<u64, Pending>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, queue: &str, tag: u64, requeue: bool) {
        let mut queues = self.queues();

        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        if let Some(mut pending) = state.unacked.remove(&tag) {
            if requeue {
                pending.redelivered = true;
                state.ready.push_front(pending);
                drop(queues);
                self.notify.notify_waiters();
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodable messages waiting in `queue`, front first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Message> {
        self.shared
            .queues()
            .get(queue)
            .map(|state| {
                state
                    .ready
                    .iter()
                    .filter_map(|pending| serde_json::from_slice(&pending.body).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw bodies waiting in `queue`, front first.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .queues()
            .get(queue)
            .map(|state| state.ready.iter().map(|pending| pending.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .queues()
            .get(queue)
            .map(|state| state.unacked.len())
            .unwrap_or(0)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.shared.queues().contains_key(queue)
    }

    fn take(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut queues = self.shared.queues();

        let state = queues.get_mut(queue).ok_or_else(|| QueueError::Consume {
            queue: queue.to_string(),
            reason: "no such queue".to_string(),
        })?;

        let Some(pending) = state.ready.pop_front() else {
            return Ok(None);
        };

        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
        state.unacked.insert(tag, pending.clone());

        let acker = MemoryAcker {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            tag,
            settled: AtomicBool::new(false),
        };

        Ok(Some(Delivery::new(
            pending.body,
            pending.redelivered,
            Box::new(acker),
        )))
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn declare(&self, queue: &str) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        self.shared.queues().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        {
            let mut queues = self.shared.queues();
            let state = queues.get_mut(queue).ok_or_else(|| QueueError::Publish {
                queue: queue.to_string(),
                reason: "no such queue".to_string(),
            })?;

            state.ready.push_back(Pending {
                body: body.to_vec(),
                redelivered: false,
            });
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Subscription>> {
        if !self.is_declared(queue) {
            return Err(QueueError::Consume {
                queue: queue.to_string(),
                reason: "no such queue".to_string(),
            });
        }

        debug!(queue = %queue, consumer_tag = %consumer_tag, "In-memory consumer registered");

        Ok(Box::new(MemorySubscription {
            backend: self.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn queue_length(&self, queue: &str) -> Result<u64> {
        self.shared
            .queues()
            .get(queue)
            .map(|state| state.ready.len() as u64)
            .ok_or_else(|| QueueError::Declaration {
                queue: queue.to_string(),
                reason: "NOT_FOUND - no queue".to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemorySubscription {
    backend: InMemoryQueue,
    queue: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            let notified = self.backend.shared.notify.notified();

            if !self.backend.is_connected() {
                return None;
            }

            match self.backend.take(&self.queue) {
                Ok(Some(delivery)) => return Some(Ok(delivery)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            notified.await;
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle_once(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Acknowledge(format!(
                "delivery {} already settled",
                self.tag
            )));
        }

        self.shared.settle(&self.queue, self.tag, requeue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle_once(false)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle_once(requeue)
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.shared.settle(&self.queue, self.tag, true);
        }
    }
}
