use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::event::SecurityEvent;

pub const SECURITY_EVENT_TYPE: &str = "security_event";

/// Unit of transport between the publisher and the consumer loops.
///
/// The JSON field names (`type`, `data`, `timestamp`, `retries`) are the wire format
/// shared with the other producers on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: String,

    #[serde(rename = "data", default)]
    pub payload: HashMap<String, serde_json::Value>,

    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "retries", default)]
    pub retry_count: u32,
}

impl Message {
    pub fn new(message_type: impl Into<String>, payload: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn from_event(event: &SecurityEvent) -> Result<Self, serde_json::Error> {
        let mut payload = HashMap::new();
        payload.insert("event".to_string(), serde_json::to_value(event)?);

        Ok(Self {
            id: event.event_id.clone(),
            message_type: SECURITY_EVENT_TYPE.to_string(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        })
    }

    /// Copy of this message carrying one more recorded failure. The count saturates, so a
    /// message already at `u32::MAX` stays there and is dead-lettered.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }
}

/// A primary queue and its two satellites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub primary: String,
    pub retry: String,
    pub dead: String,
}

impl QueueNames {
    pub fn new(primary: impl Into<String>) -> Self {
        let primary = primary.into();

        Self {
            retry: format!("{}_retry", primary),
            dead: format!("{}_dead", primary),
            primary,
        }
    }

    /// Names for the family `queue` belongs to, whether it is the primary or a satellite.
    pub fn owning(queue: &str) -> Self {
        let primary = queue
            .strip_suffix("_retry")
            .or_else(|| queue.strip_suffix("_dead"))
            .unwrap_or(queue);

        Self::new(primary)
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.primary, &self.retry, &self.dead]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_uses_shared_field_names() {
        let mut payload = HashMap::new();
        payload.insert("ip".to_string(), serde_json::json!("10.0.0.1"));
        let message = Message::new("login", payload);

        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "login");
        assert_eq!(value["data"]["ip"], "10.0.0.1");
        assert_eq!(value["retries"], 0);
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_missing_retries_defaults_to_zero() {
        let raw = r#"{"id":"abc","type":"login","data":{},"timestamp":"2024-01-01T00:00:00Z"}"#;

        let message: Message = serde_json::from_str(raw).unwrap();

        assert_eq!(message.retry_count, 0);
        assert_eq!(message.id, "abc");
    }

    #[test]
    fn test_next_attempt_keeps_identity() {
        let message = Message::new("login", HashMap::new());

        let retried = message.next_attempt().next_attempt();

        assert_eq!(retried.id, message.id);
        assert_eq!(retried.created_at, message.created_at);
        assert_eq!(retried.retry_count, 2);
    }

    #[test]
    fn test_next_attempt_saturates_at_max() {
        let message: Message = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "type": "login",
            "timestamp": "2024-01-01T00:00:00Z",
            "retries": u32::MAX,
        }))
        .unwrap();

        assert_eq!(message.next_attempt().retry_count, u32::MAX);
    }

    #[test]
    fn test_queue_names_follow_suffix_convention() {
        let names = QueueNames::new("security_events");

        assert_eq!(
            names.all(),
            ["security_events", "security_events_retry", "security_events_dead"]
        );
    }

    #[test]
    fn test_owning_resolves_satellites_to_primary() {
        assert_eq!(QueueNames::owning("events_retry"), QueueNames::new("events"));
        assert_eq!(QueueNames::owning("events_dead"), QueueNames::new("events"));
        assert_eq!(QueueNames::owning("events"), QueueNames::new("events"));
    }
}
