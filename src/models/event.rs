use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Security event as persisted by the HTTP layer before it is handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub event_id: String,
    pub event_type: String,
    pub severity: String,
    pub source: String,
    pub description: String,
    pub event_data: HashMap<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(event_type: String, severity: String, source: String) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            event_id: Uuid::new_v4().to_string(),
            event_type,
            severity,
            source,
            description: String::new(),
            event_data: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: String) -> Self {
        self.description = description;
        self
    }

    pub fn with_data(mut self, event_data: HashMap<String, JsonValue>) -> Self {
        self.event_data = event_data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::{Message, SECURITY_EVENT_TYPE};

    #[test]
    fn test_event_wraps_into_message() {
        let mut data = HashMap::new();
        data.insert("ip".to_string(), serde_json::json!("10.0.0.1"));

        let event = SecurityEvent::new("login".into(), "high".into(), "auth-service".into())
            .with_description("Failed login burst".into())
            .with_data(data);

        let message = Message::from_event(&event).unwrap();

        assert_eq!(message.id, event.event_id);
        assert_eq!(message.message_type, SECURITY_EVENT_TYPE);
        assert_eq!(message.retry_count, 0);
        assert_eq!(message.payload["event"]["event_type"], "login");
        assert_eq!(message.payload["event"]["event_data"]["ip"], "10.0.0.1");
    }
}
