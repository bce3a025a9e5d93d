use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Reserved receiver id that fans a message out to every mailbox.
pub const BROADCAST: &str = "broadcast";

/// Sender id used for bus-originated traffic such as heartbeats.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    Query,
    Response,
    Notification,
    Error,
    Thinking,
    Status,
    Heartbeat,
}

impl MessageCategory {
    pub const ALL: [MessageCategory; 7] = [
        MessageCategory::Query,
        MessageCategory::Response,
        MessageCategory::Notification,
        MessageCategory::Error,
        MessageCategory::Thinking,
        MessageCategory::Status,
        MessageCategory::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCategory::Query => "query",
            MessageCategory::Response => "response",
            MessageCategory::Notification => "notification",
            MessageCategory::Error => "error",
            MessageCategory::Thinking => "thinking",
            MessageCategory::Status => "status",
            MessageCategory::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Urgent,
    #[default]
    Normal,
    Background,
}

/// A unit of agent-to-agent communication.
///
/// Fields are fixed once the bus enqueues the message, apart from `context`
/// (merged in by the bus at send time) and the processing timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub category: MessageCategory,
    #[serde(default)]
    pub priority: MessagePriority,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    3
}

impl Message {
    pub fn new(category: MessageCategory, sender_id: &str, receiver_id: &str, content: Value) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            thread_id: id.clone(),
            id,
            category,
            priority: MessagePriority::Normal,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content,
            context: Map::new(),
            reply_to: None,
            timeout_seconds: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            created_at: Utc::now(),
            enqueued_at: None,
            processing_started_at: None,
            processed_at: None,
        }
    }

    pub fn query(sender_id: &str, receiver_id: &str, content: Value) -> Self {
        Self::new(MessageCategory::Query, sender_id, receiver_id, content)
    }

    pub fn notification(sender_id: &str, receiver_id: &str, content: Value) -> Self {
        Self::new(MessageCategory::Notification, sender_id, receiver_id, content)
    }

    pub fn heartbeat(receiver_id: &str) -> Self {
        Self::new(MessageCategory::Heartbeat, SYSTEM_SENDER, receiver_id, Value::Null)
            .with_priority(MessagePriority::Background)
    }

    /// Build a reply addressed to the sender of `original`, in the same thread.
    pub fn reply(original: &Message, category: MessageCategory, content: Value) -> Self {
        let mut msg = Self::new(category, &original.receiver_id, &original.sender_id, content);
        msg.reply_to = Some(original.id.clone());
        msg.thread_id = original.thread_id.clone();
        msg.priority = original.priority;
        msg
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Correlate with an earlier message; the thread becomes that message's id.
    pub fn with_reply_to(mut self, message_id: &str) -> Self {
        self.reply_to = Some(message_id.to_string());
        self.thread_id = message_id.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }

    /// A message with a timeout is expired once it has waited longer than that.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.timeout_seconds {
            Some(secs) if secs > 0.0 => {
                let age = (now - self.created_at).num_milliseconds() as f64 / 1000.0;
                age > secs
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thread_defaults_to_own_id() {
        let msg = Message::query("a", "b", json!({"q": 1}));
        assert_eq!(msg.thread_id, msg.id);
        assert_eq!(msg.max_retries, 3);
        assert!(msg.reply_to.is_none());
    }

    #[test]
    fn test_reply_inherits_thread() {
        let q = Message::query("a", "b", json!({}));
        let r = Message::reply(&q, MessageCategory::Response, json!({"ok": true}));
        assert_eq!(r.sender_id, "b");
        assert_eq!(r.receiver_id, "a");
        assert_eq!(r.reply_to.as_deref(), Some(q.id.as_str()));
        assert_eq!(r.thread_id, q.thread_id);

        let n = Message::notification("b", "a", json!({})).with_reply_to(&q.id);
        assert_eq!(n.thread_id, q.id);
    }

    #[test]
    fn test_expiry() {
        let msg = Message::query("a", "b", json!({})).with_timeout(Duration::from_secs(2));
        assert!(!msg.is_expired_at(msg.created_at + chrono::Duration::seconds(1)));
        assert!(msg.is_expired_at(msg.created_at + chrono::Duration::seconds(3)));
        let no_timeout = Message::query("a", "b", json!({}));
        assert!(!no_timeout.is_expired_at(Utc::now() + chrono::Duration::days(1)));
    }

    #[test]
    fn test_category_serde() {
        let v = serde_json::to_value(MessageCategory::Heartbeat).unwrap();
        assert_eq!(v, json!("heartbeat"));
        assert_eq!(MessageCategory::ALL.len(), 7);
    }
}
