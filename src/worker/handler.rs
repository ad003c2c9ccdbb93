use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    error::ProcessingError,
    models::message::{Message, SECURITY_EVENT_TYPE},
};

/// Processes one message type. Delivery is at-least-once, so the same `id` can arrive
/// more than once and implementations must tolerate that.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError>;
}

/// Routes messages to handlers by their `type` field.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    fallback: Arc<dyn MessageHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(UnhandledTypeHandler),
        }
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in security event handler.
    pub fn with_defaults() -> Self {
        Self::new().register(SECURITY_EVENT_TYPE, Arc::new(SecurityEventHandler))
    }

    pub fn register(mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    pub fn with_fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = handler;
        self
    }

    pub fn resolve(&self, message_type: &str) -> Arc<dyn MessageHandler> {
        self.handlers
            .get(message_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Acknowledges messages nobody registered for, logging them so nothing disappears silently.
pub struct UnhandledTypeHandler;

#[async_trait]
impl MessageHandler for UnhandledTypeHandler {
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
        info!(
            message_id = %message.id,
            message_type = %message.message_type,
            "No handler registered for message type, acknowledging"
        );
        Ok(())
    }
}

pub struct SecurityEventHandler;

#[async_trait]
impl MessageHandler for SecurityEventHandler {
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
        let event = message
            .payload
            .get("event")
            .and_then(|v| v.as_object())
            .ok_or_else(|| ProcessingError::InvalidPayload("missing event object".to_string()))?;

        let event_type = event
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let category = match event_type {
            "login" => "authentication",
            "data_access" => "data access",
            "file_access" => "file access",
            _ => "generic",
        };

        debug!(message_id = %message.id, event_type, "Processing security event");

        info!(
            message_id = %message.id,
            event_type,
            category,
            severity = event.get("severity").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "Security event processed"
        );

        Ok(())
    }
}
