use async_trait::async_trait;
use conclave_core::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::entry::{rank, MemoryEntry, MemoryFilter, MemoryType, MemoryUpdate};

/// Backend for the durable tiers (episodic, semantic, procedural).
#[async_trait]
pub trait DurableStorage: Send + Sync {
    /// Insert or replace `entry` under `tier`.
    async fn put(&self, tier: MemoryType, entry: &MemoryEntry) -> Result<()>;

    /// Entries of `tier` matching `filter`, best first.
    async fn query(&self, tier: MemoryType, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>>;

    /// Apply `update`; returns the updated entry, or `None` if the id is unknown.
    async fn update(&self, id: &str, update: &MemoryUpdate) -> Result<Option<MemoryEntry>>;

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>>;

    async fn count(&self, tier: MemoryType) -> Result<usize>;
}

/// Process-local backend, used in tests and with `backend: inMemory`.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStorage for InMemoryStorage {
    async fn put(&self, tier: MemoryType, entry: &MemoryEntry) -> Result<()> {
        let mut stored = entry.clone();
        stored.memory_type = tier;
        self.entries.write().await.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn query(&self, tier: MemoryType, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let entries = self.entries.read().await;
        let mut out: Vec<MemoryEntry> = entries
            .values()
            .filter(|e| e.memory_type == tier && filter.matches(e))
            .cloned()
            .collect();
        out.sort_by(rank);
        Ok(out)
    }

    async fn update(&self, id: &str, update: &MemoryUpdate) -> Result<Option<MemoryEntry>> {
        let mut entries = self.entries.write().await;
        Ok(entries.get_mut(id).map(|entry| {
            update.apply(entry);
            entry.clone()
        }))
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn count(&self, tier: MemoryType) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.memory_type == tier)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_sets_tier_and_query_filters() {
        let storage = InMemoryStorage::new();
        let entry = MemoryEntry::new(MemoryType::Working, "a", json!("x"), 0.8).with_tags(["pattern"]);
        storage.put(MemoryType::Semantic, &entry).await.unwrap();

        let filter = MemoryFilter {
            requester: Some("a".into()),
            ..Default::default()
        };
        let found = storage.query(MemoryType::Semantic, &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].memory_type, MemoryType::Semantic);
        assert!(storage.query(MemoryType::Episodic, &filter).await.unwrap().is_empty());

        let stranger = MemoryFilter {
            requester: Some("b".into()),
            ..Default::default()
        };
        assert!(storage.query(MemoryType::Semantic, &stranger).await.unwrap().is_empty());
        assert_eq!(storage.count(MemoryType::Semantic).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let storage = InMemoryStorage::new();
        let res = storage.update("missing", &MemoryUpdate::default()).await.unwrap();
        assert!(res.is_none());
    }
}
