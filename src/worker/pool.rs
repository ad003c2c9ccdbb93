use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{error, info, warn};

use crate::{
    clients::queue::QueueClient,
    config::Config,
    error::Result,
    models::message::QueueNames,
    worker::{
        consumer::{Consumer, ConsumerSettings},
        handler::HandlerRegistry,
    },
};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue_name: String,
    pub worker_count: usize,
    pub consumer: ConsumerSettings,
    pub shutdown_grace_period: Duration,
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue_name: config.queue_name.clone(),
            worker_count: config.worker_count,
            consumer: ConsumerSettings {
                max_retries: config.max_retries,
                handler_timeout: config.handler_timeout(),
                ..ConsumerSettings::default()
            },
            shutdown_grace_period: config.shutdown_grace_period(),
        }
    }
}

/// How the workers ended when the pool was stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub failed: usize,
    pub abandoned: usize,
}

struct Worker {
    id: usize,
    queue: String,
    handle: JoinHandle<Result<()>>,
}

/// Fixed set of consumers on a queue and its retry satellite, sharing one cancellation
/// signal.
pub struct WorkerPool {
    queues: QueueNames,
    shutdown: watch::Sender<bool>,
    workers: Vec<Worker>,
    grace_period: Duration,
}

impl WorkerPool {
    /// Declares the queue family, then starts `worker_count` consumers on the primary
    /// queue and as many on the retry queue. Every consumer subscribes before this
    /// returns, so a broker that refuses a subscription fails the start and stops the
    /// workers already running.
    pub async fn start(
        client: QueueClient,
        handlers: Arc<HandlerRegistry>,
        config: PoolConfig,
    ) -> Result<Self> {
        let queues = QueueNames::new(config.queue_name.clone());
        client.declare_all(&queues).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut pool = Self {
            queues,
            shutdown,
            workers: Vec::with_capacity(config.worker_count * 2),
            grace_period: config.shutdown_grace_period,
        };

        let sources = [pool.queues.primary.clone(), pool.queues.retry.clone()];
        for (offset, source) in sources.into_iter().enumerate() {
            for n in 1..=config.worker_count {
                let id = offset * config.worker_count + n;
                let consumer = Consumer::new(
                    id,
                    source.clone(),
                    client.clone(),
                    Arc::clone(&handlers),
                    config.consumer.clone(),
                );

                let subscription = match consumer.subscribe().await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        error!(worker_id = id, queue = %source, error = %e, "Worker failed to subscribe");
                        pool.stop().await;
                        return Err(e);
                    }
                };

                pool.workers.push(Worker {
                    id,
                    queue: source.clone(),
                    handle: tokio::spawn(consumer.serve(subscription, shutdown_rx.clone())),
                });
            }
        }

        info!(
            queue = %pool.queues.primary,
            workers_per_queue = config.worker_count,
            max_retries = config.consumer.max_retries,
            "Worker pool started"
        );

        Ok(pool)
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker and waits up to the grace period for them to return.
    /// Workers still busy after that are aborted; their in-flight message stays
    /// unacknowledged and is redelivered by the broker.
    pub async fn stop(self) -> ShutdownReport {
        info!(queue = %self.queues.primary, "Stopping worker pool");

        let _ = self.shutdown.send(true);

        let deadline = Instant::now() + self.grace_period;
        let mut report = ShutdownReport::default();

        for mut worker in self.workers {
            match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(Ok(()))) => report.stopped += 1,
                Ok(Ok(Err(e))) => {
                    warn!(worker_id = worker.id, queue = %worker.queue, error = %e, "Worker exited with error");
                    report.failed += 1;
                }
                Ok(Err(e)) => {
                    error!(worker_id = worker.id, queue = %worker.queue, error = %e, "Worker task panicked");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(
                        worker_id = worker.id,
                        queue = %worker.queue,
                        "Worker did not finish within grace period, abandoning in-flight message"
                    );
                    worker.handle.abort();
                    let _ = worker.handle.await;
                    report.abandoned += 1;
                }
            }
        }

        info!(
            stopped = report.stopped,
            failed = report.failed,
            abandoned = report.abandoned,
            "Worker pool stopped"
        );

        report
    }
}
