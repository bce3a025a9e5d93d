use chrono::{DateTime, Utc};
use conclave_core::Message;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Threads remembered at once, per log and per agent; the least recently
/// started thread is forgotten first.
pub(crate) const MAX_THREADS: usize = 1024;

/// Per-agent conversation record kept by the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContext {
    pub active_threads: BTreeSet<String>,
    pub message_count: u64,
    pub last_active: Option<DateTime<Utc>>,
    #[serde(skip)]
    thread_order: VecDeque<String>,
}

impl AgentContext {
    pub fn touch(&mut self, thread_id: &str, at: DateTime<Utc>) {
        if self.active_threads.insert(thread_id.to_string()) {
            self.thread_order.push_back(thread_id.to_string());
            while self.thread_order.len() > MAX_THREADS {
                if let Some(oldest) = self.thread_order.pop_front() {
                    self.active_threads.remove(&oldest);
                }
            }
        }
        self.message_count += 1;
        self.last_active = Some(at);
    }

    fn summary(&self) -> Value {
        json!({
            "active_threads": self.active_threads.len(),
            "message_count": self.message_count,
            "last_active": self.last_active.map(|t| t.to_rfc3339()),
        })
    }
}

/// Bounded per-thread message history.
pub struct ConversationLog {
    limit: usize,
    threads: HashMap<String, VecDeque<Message>>,
    order: VecDeque<String>,
}

impl ConversationLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            threads: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Fill `message.context` from its thread and the sender's record.
    ///
    /// Keys already on the message win. Context set earlier in the thread is
    /// carried forward, newest first.
    pub fn merge_into(&self, message: &mut Message, sender: Option<&AgentContext>) {
        let mut merged: Map<String, Value> = Map::new();

        if let Some(history) = self.threads.get(&message.thread_id) {
            for earlier in history.iter().rev() {
                for (k, v) in &earlier.context {
                    if !k.starts_with('_') && !merged.contains_key(k) {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
            merged.insert("_thread_length".into(), json!(history.len()));
            if let Some(last) = history.back() {
                merged.insert("_previous_message_id".into(), json!(last.id));
            }
        } else {
            merged.insert("_thread_length".into(), json!(0));
        }

        if let Some(ctx) = sender {
            merged.insert("_sender".into(), ctx.summary());
        }

        for (k, v) in std::mem::take(&mut message.context) {
            merged.insert(k, v);
        }
        message.context = merged;
    }

    pub fn append(&mut self, message: &Message) {
        if !self.threads.contains_key(&message.thread_id) {
            self.order.push_back(message.thread_id.clone());
            while self.order.len() > MAX_THREADS {
                if let Some(oldest) = self.order.pop_front() {
                    self.threads.remove(&oldest);
                }
            }
        }
        let history = self.threads.entry(message.thread_id.clone()).or_default();
        history.push_back(message.clone());
        while history.len() > self.limit {
            history.pop_front();
        }
    }

    pub fn history(&self, thread_id: &str) -> Vec<Message> {
        self.threads
            .get(thread_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::MessageCategory;

    #[test]
    fn test_context_carries_forward_in_thread() {
        let mut log = ConversationLog::new(10);
        let mut first = Message::query("a", "b", json!("q")).with_context("task_id", json!("T1"));
        log.merge_into(&mut first, None);
        log.append(&first);

        let mut reply = Message::reply(&first, MessageCategory::Response, json!("r"));
        log.merge_into(&mut reply, None);

        assert_eq!(reply.context.get("task_id"), Some(&json!("T1")));
        assert_eq!(reply.context.get("_thread_length"), Some(&json!(1)));
        assert_eq!(reply.context.get("_previous_message_id"), Some(&json!(first.id)));
    }

    #[test]
    fn test_own_context_wins() {
        let mut log = ConversationLog::new(10);
        let first = Message::query("a", "b", json!("q")).with_context("k", json!(1));
        log.append(&first);

        let mut next = Message::reply(&first, MessageCategory::Response, json!(null))
            .with_context("k", json!(2));
        log.merge_into(&mut next, None);
        assert_eq!(next.context.get("k"), Some(&json!(2)));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut log = ConversationLog::new(3);
        let root = Message::query("a", "b", json!(0));
        log.append(&root);
        for i in 1..10 {
            let m = Message::notification("a", "b", json!(i)).with_reply_to(&root.id);
            log.append(&m);
        }
        let history = log.history(&root.id);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, json!(9));
    }

    #[test]
    fn test_thread_tracking_is_bounded() {
        let mut log = ConversationLog::new(2);
        let mut ctx = AgentContext::default();
        let now = Utc::now();
        let mut first_thread = String::new();
        for i in 0..MAX_THREADS + 10 {
            let m = Message::notification("a", "b", json!(i));
            if i == 0 {
                first_thread = m.thread_id.clone();
            }
            log.append(&m);
            ctx.touch(&m.thread_id, now);
        }

        assert_eq!(log.thread_count(), MAX_THREADS);
        assert!(log.history(&first_thread).is_empty());
        assert_eq!(ctx.active_threads.len(), MAX_THREADS);
        assert!(!ctx.active_threads.contains(&first_thread));
        assert_eq!(ctx.message_count, (MAX_THREADS + 10) as u64);

        // Touching a known thread again does not evict anything
        let newest = ctx.thread_order.back().cloned().unwrap();
        ctx.touch(&newest, now);
        assert_eq!(ctx.active_threads.len(), MAX_THREADS);
    }

    #[test]
    fn test_sender_summary() {
        let log = ConversationLog::new(5);
        let mut ctx = AgentContext::default();
        ctx.touch("t1", Utc::now());
        let mut m = Message::query("a", "b", json!(null));
        log.merge_into(&mut m, Some(&ctx));
        assert_eq!(m.context["_sender"]["message_count"], json!(1));
    }
}
