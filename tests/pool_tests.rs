use std::{
    collections::HashSet,
    sync::{Arc, atomic::{AtomicU32, Ordering}},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use event_queue::{
    clients::{
        memory::InMemoryQueue,
        queue::{QueueBackend, QueueClient, Subscription},
    },
    error::QueueError,
    models::message::QueueNames,
    worker::{
        consumer::ConsumerSettings,
        handler::{HandlerRegistry, MessageHandler},
        pool::{PoolConfig, WorkerPool},
    },
};

use crate::support::{FlakyHandler, StuckHandler, login_message, memory_client, wait_until};

fn pool_config(queue: &str, workers: usize) -> PoolConfig {
    PoolConfig {
        queue_name: queue.to_string(),
        worker_count: workers,
        consumer: ConsumerSettings {
            max_retries: 3,
            handler_timeout: Duration::from_secs(5),
            requeue_delay: Duration::from_millis(50),
        },
        shutdown_grace_period: Duration::from_millis(500),
    }
}

fn registry(handler: Arc<dyn MessageHandler>) -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::new().register("login", handler))
}

#[tokio::test]
async fn test_pool_spawns_consumers_for_primary_and_retry() -> Result<()> {
    let (backend, client) = memory_client();

    let pool = WorkerPool::start(client, registry(FlakyHandler::new(0)), pool_config("events", 3)).await?;

    assert_eq!(pool.worker_count(), 6);
    for queue in pool.queues().all() {
        assert!(backend.is_declared(queue));
    }

    let report = pool.stop().await;
    assert_eq!(report.stopped, 6);
    assert_eq!(report.abandoned, 0);

    Ok(())
}

#[tokio::test]
async fn test_pool_drains_queue_with_each_message_processed_once() -> Result<()> {
    let (backend, client) = memory_client();
    let handler = FlakyHandler::new(0);
    client.declare_all(&QueueNames::new("events")).await?;

    let mut published = HashSet::new();
    for _ in 0..20 {
        let message = login_message();
        published.insert(message.id.clone());
        client.publish(&message, "events").await?;
    }

    let pool = WorkerPool::start(client.clone(), registry(handler.clone()), pool_config("events", 4)).await?;

    let drained = wait_until(Duration::from_secs(5), || {
        let handler = handler.clone();
        async move { handler.succeeded().len() >= 20 }
    })
    .await;
    assert!(drained, "workers should process every message");

    pool.stop().await;

    let processed = handler.succeeded();
    assert_eq!(processed.len(), 20);
    assert_eq!(processed.into_iter().collect::<HashSet<_>>(), published);
    assert_eq!(backend.queue_length("events").await?, 0);
    assert_eq!(backend.unacked_count("events"), 0);

    Ok(())
}

/// Scenario B through the running pool.
#[tokio::test]
async fn test_pool_retries_until_success() -> Result<()> {
    let (backend, client) = memory_client();
    let handler = FlakyHandler::new(2);

    let pool = WorkerPool::start(client.clone(), registry(handler.clone()), pool_config("events", 2)).await?;
    let message = login_message();
    client.publish(&message, "events").await?;

    let done = wait_until(Duration::from_secs(5), || {
        let handler = handler.clone();
        async move { !handler.succeeded().is_empty() }
    })
    .await;
    assert!(done);

    pool.stop().await;

    assert_eq!(handler.attempts(), 3);
    assert_eq!(handler.succeeded(), vec![message.id]);
    for queue in ["events", "events_retry", "events_dead"] {
        assert_eq!(backend.queue_length(queue).await?, 0);
    }

    Ok(())
}

/// Scenario C through the running pool.
#[tokio::test]
async fn test_pool_dead_letters_after_max_retries() -> Result<()> {
    let (backend, client) = memory_client();
    let handler = FlakyHandler::always_failing();

    let pool = WorkerPool::start(client.clone(), registry(handler.clone()), pool_config("events", 2)).await?;
    let message = login_message();
    client.publish(&message, "events").await?;

    let dead_lettered = wait_until(Duration::from_secs(5), || {
        let backend = backend.clone();
        async move { backend.queue_length("events_dead").await.unwrap_or(0) == 1 }
    })
    .await;
    assert!(dead_lettered);

    pool.stop().await;

    let dead = backend.ready_messages("events_dead");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, message.id);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(handler.attempts(), 3);
    assert_eq!(backend.queue_length("events").await?, 0);
    assert_eq!(backend.queue_length("events_retry").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_stop_abandons_stuck_worker_and_releases_message() -> Result<()> {
    let (backend, client) = memory_client();
    let handler = Arc::new(StuckHandler {
        started: AtomicU32::new(0),
    });

    let mut config = pool_config("events", 1);
    config.consumer.handler_timeout = Duration::from_secs(3600);
    config.shutdown_grace_period = Duration::from_millis(100);

    let pool = WorkerPool::start(client.clone(), registry(handler.clone()), config).await?;
    client.publish(&login_message(), "events").await?;

    let started = wait_until(Duration::from_secs(5), || {
        let handler = handler.clone();
        async move { handler.started.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(started);

    let report = pool.stop().await;

    assert_eq!(report.abandoned, 1);
    assert_eq!(report.stopped, 1);
    assert_eq!(backend.unacked_count("events"), 0);
    assert_eq!(backend.ready_messages("events").len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_no_processing_after_stop() -> Result<()> {
    let (backend, client) = memory_client();
    let handler = FlakyHandler::new(0);

    let pool = WorkerPool::start(client.clone(), registry(handler.clone()), pool_config("events", 3)).await?;
    for _ in 0..5 {
        client.publish(&login_message(), "events").await?;
    }

    let drained = wait_until(Duration::from_secs(5), || {
        let handler = handler.clone();
        async move { handler.succeeded().len() == 5 }
    })
    .await;
    assert!(drained);

    let report = pool.stop().await;
    assert_eq!(report.stopped, 6);

    client.publish(&login_message(), "events").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.attempts(), 5);
    assert_eq!(backend.queue_length("events").await?, 1);

    Ok(())
}

/// Backend that refuses subscriptions on retry queues.
struct RetrySubscribeRefused {
    inner: InMemoryQueue,
}

#[async_trait]
impl QueueBackend for RetrySubscribeRefused {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn declare(&self, queue: &str) -> event_queue::error::Result<()> {
        self.inner.declare(queue).await
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> event_queue::error::Result<()> {
        self.inner.publish(queue, body).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> event_queue::error::Result<Box<dyn Subscription>> {
        if queue.ends_with("_retry") {
            return Err(QueueError::Consume {
                queue: queue.to_string(),
                reason: "access refused".to_string(),
            });
        }
        self.inner.subscribe(queue, consumer_tag).await
    }

    async fn queue_length(&self, queue: &str) -> event_queue::error::Result<u64> {
        self.inner.queue_length(queue).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&self) -> event_queue::error::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_start_fails_when_a_worker_cannot_subscribe() -> Result<()> {
    let inner = InMemoryQueue::new();
    let client = QueueClient::new(Arc::new(RetrySubscribeRefused { inner: inner.clone() }));
    let handler = FlakyHandler::new(0);

    let result = WorkerPool::start(client.clone(), registry(handler.clone()), pool_config("events", 2)).await;

    assert!(matches!(result, Err(QueueError::Consume { .. })));

    // Primary workers started before the failure must be stopped again.
    client.publish(&login_message(), "events").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.attempts(), 0);
    assert_eq!(inner.ready_messages("events").len(), 1);

    Ok(())
}
