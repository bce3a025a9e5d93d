use async_trait::async_trait;
use conclave_storage::{MemoryEntry, MemoryShareHook};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::bus::MessageBus;

/// Announces Shared and Public memory entries to every other agent on the bus.
pub struct BusShareHook {
    bus: Arc<MessageBus>,
}

impl BusShareHook {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl MemoryShareHook for BusShareHook {
    async fn on_shared(&self, entry: &MemoryEntry) {
        let delivered = self
            .bus
            .broadcast_notification(
                &entry.owner_id,
                json!({
                    "type": "memory_shared",
                    "memory_id": entry.id,
                    "memory_type": entry.memory_type,
                    "access_level": entry.access_level,
                    "tags": entry.tags,
                    "importance": entry.importance,
                }),
            )
            .await;
        debug!(memory_id = %entry.id, owner = %entry.owner_id, delivered, "Shared memory announced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::{BusConfig, MemoryConfig};
    use conclave_storage::{AccessLevel, InMemoryStorage, MemoryStore, MemoryType};

    #[tokio::test]
    async fn test_shared_entries_are_announced() {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        bus.register_agent("a").await.unwrap();
        bus.register_agent("b").await.unwrap();

        let store = MemoryStore::new(MemoryConfig::default(), Arc::new(InMemoryStorage::new()));
        store.set_share_hook(Arc::new(BusShareHook::new(bus.clone())));

        let private = MemoryEntry::new(MemoryType::Working, "a", json!("mine"), 0.4);
        store.store(private).await.unwrap();
        assert_eq!(bus.mailbox_depth("b").await, Some(0));

        let shared = MemoryEntry::new(MemoryType::Semantic, "a", json!("ours"), 0.9)
            .with_access(AccessLevel::Public);
        store.store(shared).await.unwrap();
        assert_eq!(bus.mailbox_depth("b").await, Some(1));
        assert_eq!(bus.mailbox_depth("a").await, Some(0));
    }
}
