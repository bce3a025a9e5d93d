use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Last-seen table for agents. An agent counts as stalled once it has been
/// silent for more than twice the heartbeat interval.
pub struct HeartbeatMonitor {
    interval: Duration,
    last_seen: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, agent_id: &str) {
        self.record_at(agent_id, Utc::now()).await;
    }

    pub async fn record_at(&self, agent_id: &str, at: DateTime<Utc>) {
        debug!(agent_id = %agent_id, "Heartbeat recorded");
        self.last_seen.write().await.insert(agent_id.to_string(), at);
    }

    pub async fn last_seen(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.last_seen.read().await.get(agent_id).copied()
    }

    pub async fn forget(&self, agent_id: &str) {
        self.last_seen.write().await.remove(agent_id);
    }

    /// Agents silent for longer than `2 * interval` at `now`, sorted by id.
    pub async fn stalled_agents_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let limit = self.interval * 2;
        let seen = self.last_seen.read().await;
        let mut stalled: Vec<String> = seen
            .iter()
            .filter(|(_, at)| (now - **at).to_std().unwrap_or(Duration::ZERO) > limit)
            .map(|(id, _)| id.clone())
            .collect();
        stalled.sort();
        stalled
    }
}
