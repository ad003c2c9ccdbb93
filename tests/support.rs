use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use event_queue::{
    clients::{memory::InMemoryQueue, queue::QueueClient},
    error::ProcessingError,
    models::message::Message,
    worker::handler::MessageHandler,
};

pub fn memory_client() -> (InMemoryQueue, QueueClient) {
    let backend = InMemoryQueue::new();
    let client = QueueClient::new(Arc::new(backend.clone()));
    (backend, client)
}

pub fn login_message() -> Message {
    let mut payload = HashMap::new();
    payload.insert("ip".to_string(), serde_json::json!("10.0.0.1"));
    Message::new("login", payload)
}

/// Fails the first `failures` attempts across all messages, then succeeds.
pub struct FlakyHandler {
    failures: u32,
    attempts: AtomicU32,
    succeeded: Mutex<Vec<String>>,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: AtomicU32::new(0),
            succeeded: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn succeeded(&self) -> Vec<String> {
        self.succeeded.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if attempt < self.failures {
            return Err(ProcessingError::Failed(format!("attempt {} failed", attempt + 1)));
        }

        self.succeeded.lock().unwrap().push(message.id.clone());
        Ok(())
    }
}

/// Never finishes within any reasonable grace period.
pub struct StuckHandler {
    pub started: AtomicU32,
}

#[async_trait]
impl MessageHandler for StuckHandler {
    async fn handle(&self, _message: &Message) -> Result<(), ProcessingError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition().await
}
