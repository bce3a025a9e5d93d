use async_trait::async_trait;
use chrono::Utc;
use conclave_core::{Error, MemoryConfig, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::durable::DurableStorage;
use crate::entry::{rank, MemoryEntry, MemoryFilter, MemoryType, MemoryUpdate};

/// Called after a Shared or Public entry is stored, so other agents can be told.
#[async_trait]
pub trait MemoryShareHook: Send + Sync {
    async fn on_shared(&self, entry: &MemoryEntry);
}

/// Parameters for `MemoryStore::retrieve`.
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    /// Restrict to one tier; all tiers when `None`.
    pub memory_type: Option<MemoryType>,
    pub tags: BTreeSet<String>,
    pub context: Map<String, Value>,
    /// The caller. Private entries are only returned to their owner.
    pub owner_id: Option<String>,
    pub limit: usize,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            memory_type: None,
            tags: BTreeSet::new(),
            context: Map::new(),
            owner_id: None,
            limit: 10,
        }
    }
}

impl MemoryQuery {
    pub fn new(owner_id: &str) -> Self {
        Self {
            owner_id: Some(owner_id.to_string()),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn filter(&self) -> MemoryFilter {
        MemoryFilter {
            tags: self.tags.clone(),
            context: self.context.clone(),
            requester: self.owner_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryStats {
    pub working: usize,
    pub episodic: usize,
    pub semantic: usize,
    pub procedural: usize,
}

/// Four-tier memory: a bounded in-process working table in front of durable storage.
pub struct MemoryStore {
    config: MemoryConfig,
    working: RwLock<HashMap<String, MemoryEntry>>,
    durable: Arc<dyn DurableStorage>,
    share_hook: std::sync::RwLock<Option<Arc<dyn MemoryShareHook>>>,
}

impl MemoryStore {
    pub fn new(config: MemoryConfig, durable: Arc<dyn DurableStorage>) -> Self {
        Self {
            config,
            working: RwLock::new(HashMap::new()),
            durable,
            share_hook: std::sync::RwLock::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn set_share_hook(&self, hook: Arc<dyn MemoryShareHook>) {
        let mut slot = self.share_hook.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(hook);
    }

    fn share_hook(&self) -> Option<Arc<dyn MemoryShareHook>> {
        self.share_hook
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Store an entry. Returns `true` for a new id, `false` when it replaced an existing one.
    ///
    /// A full working table first evicts its least important, least recently
    /// accessed entry; that entry is persisted when its importance is above
    /// `persist_threshold` and dropped otherwise.
    ///
    /// An id lives in exactly one tier. Storing into a durable tier promotes
    /// any working copy; storing a promoted id back into `Working` is rejected.
    pub async fn store(&self, entry: MemoryEntry) -> Result<bool> {
        validate(&entry)?;

        let is_new = if entry.memory_type.is_durable() {
            let existed = self.durable.get(&entry.id).await?.is_some();
            self.durable.put(entry.memory_type, &entry).await?;
            let promoted = self.working.write().await.remove(&entry.id).is_some();
            if promoted {
                debug!(id = %entry.id, tier = %entry.memory_type, "Working copy promoted on store");
            }
            !existed && !promoted
        } else {
            self.store_working(entry.clone()).await?
        };

        debug!(id = %entry.id, tier = %entry.memory_type, owner = %entry.owner_id, "Memory stored");

        if entry.is_shared() {
            if let Some(hook) = self.share_hook() {
                hook.on_shared(&entry).await;
            }
        }
        Ok(is_new)
    }

    async fn store_working(&self, entry: MemoryEntry) -> Result<bool> {
        let mut working = self.working.write().await;

        if !working.contains_key(&entry.id) && self.durable.get(&entry.id).await?.is_some() {
            return Err(Error::Validation(format!(
                "memory '{}' already lives in a durable tier",
                entry.id
            )));
        }

        if working.contains_key(&entry.id) {
            working.insert(entry.id.clone(), entry);
            return Ok(false);
        }

        while working.len() >= self.config.working_memory_limit {
            let Some(victim_id) = working
                .values()
                .min_by(|a, b| {
                    a.importance
                        .total_cmp(&b.importance)
                        .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
                })
                .map(|e| e.id.clone())
            else {
                break;
            };

            if let Some(victim) = working.get(&victim_id) {
                if victim.importance > self.config.persist_threshold {
                    let tier = MemoryType::classify(&victim.tags);
                    self.durable.put(tier, victim).await?;
                    info!(id = %victim_id, tier = %tier, importance = victim.importance, "Evicted working memory persisted");
                } else {
                    debug!(id = %victim_id, importance = victim.importance, "Evicted working memory discarded");
                }
            }
            working.remove(&victim_id);
        }

        working.insert(entry.id.clone(), entry);
        Ok(true)
    }

    /// Entries matching the query, ordered by importance then recency and truncated to `limit`.
    pub async fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let filter = query.filter();
        let tiers: Vec<MemoryType> = match query.memory_type {
            Some(t) => vec![t],
            None => MemoryType::ALL.to_vec(),
        };

        let mut results = Vec::new();
        for tier in tiers {
            if tier == MemoryType::Working {
                let working = self.working.read().await;
                results.extend(working.values().filter(|e| filter.matches(e)).cloned());
            } else {
                results.extend(self.durable.query(tier, &filter).await?);
            }
        }

        results.sort_by(rank);
        results.truncate(query.limit);

        let now = Utc::now();
        let mut working = self.working.write().await;
        for entry in results.iter_mut().filter(|e| e.memory_type == MemoryType::Working) {
            if let Some(stored) = working.get_mut(&entry.id) {
                stored.last_accessed_at = now;
                entry.last_accessed_at = now;
            }
        }
        Ok(results)
    }

    /// Apply field updates and bump the version. Returns `false` for an unknown id.
    pub async fn update(&self, id: &str, update: &MemoryUpdate) -> Result<bool> {
        if let Some(importance) = update.importance {
            check_importance(importance)?;
        }
        if update.is_empty() {
            return Ok(self.get(id).await?.is_some());
        }

        {
            let mut working = self.working.write().await;
            if let Some(entry) = working.get_mut(id) {
                update.apply(entry);
                debug!(id = %id, version = entry.version, "Working memory updated");
                return Ok(true);
            }
        }

        Ok(self.durable.update(id, update).await?.is_some())
    }

    pub async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        if let Some(entry) = self.working.read().await.get(id) {
            return Ok(Some(entry.clone()));
        }
        self.durable.get(id).await
    }

    pub async fn working_len(&self) -> usize {
        self.working.read().await.len()
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        Ok(MemoryStats {
            working: self.working_len().await,
            episodic: self.durable.count(MemoryType::Episodic).await?,
            semantic: self.durable.count(MemoryType::Semantic).await?,
            procedural: self.durable.count(MemoryType::Procedural).await?,
        })
    }

    /// Promote every working entry above `consolidation_threshold` into its durable tier.
    /// Entries whose persist fails stay in the working table for the next sweep.
    pub async fn consolidate(&self) -> Result<usize> {
        let candidates: Vec<MemoryEntry> = {
            let working = self.working.read().await;
            working
                .values()
                .filter(|e| e.importance > self.config.consolidation_threshold)
                .cloned()
                .collect()
        };

        let mut promoted = 0;
        for entry in candidates {
            let tier = MemoryType::classify(&entry.tags);
            if let Err(e) = self.durable.put(tier, &entry).await {
                warn!(id = %entry.id, error = %e, "Consolidation persist failed");
                continue;
            }
            let mut working = self.working.write().await;
            // An update that raced the persist keeps its newer version in place
            if working.get(&entry.id).map(|w| w.version) == Some(entry.version) {
                working.remove(&entry.id);
                promoted += 1;
            }
        }

        if promoted > 0 {
            info!(promoted, "Working memory consolidated");
        }
        Ok(promoted)
    }

    pub async fn run_consolidation_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.consolidation_interval();
        info!(interval_secs = period.as_secs(), "Memory consolidation started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.consolidate().await {
                        error!(error = %e, "Memory consolidation failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Memory consolidation shutting down");
                    break;
                }
            }
        }
    }
}

fn check_importance(importance: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&importance) {
        return Err(Error::Validation(format!(
            "importance must be within [0, 1], got {}",
            importance
        )));
    }
    Ok(())
}

fn validate(entry: &MemoryEntry) -> Result<()> {
    if entry.id.trim().is_empty() {
        return Err(Error::Validation("memory id must not be empty".to_string()));
    }
    if entry.owner_id.trim().is_empty() {
        return Err(Error::Validation("memory owner must not be empty".to_string()));
    }
    check_importance(entry.importance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::InMemoryStorage;
    use crate::entry::AccessLevel;
    use serde_json::json;
    use std::sync::Mutex;

    fn test_store(limit: usize) -> (MemoryStore, Arc<InMemoryStorage>) {
        let durable = Arc::new(InMemoryStorage::new());
        let config = MemoryConfig {
            working_memory_limit: limit,
            ..Default::default()
        };
        (MemoryStore::new(config, durable.clone()), durable)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (store, _) = test_store(10);
        let entry = MemoryEntry::new(MemoryType::Working, "a", json!({"fact": 42}), 0.4)
            .with_tags(["alpha", "beta"]);
        assert!(store.store(entry.clone()).await.unwrap());

        let found = store
            .retrieve(&MemoryQuery::new("a").of_type(MemoryType::Working).with_tags(["alpha", "beta"]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, entry.id);
        assert_eq!(found[0].content, entry.content);

        let durable_entry = MemoryEntry::new(MemoryType::Semantic, "a", json!("rule"), 0.6)
            .with_tags(["pattern"]);
        store.store(durable_entry.clone()).await.unwrap();
        let found = store
            .retrieve(&MemoryQuery::new("a").of_type(MemoryType::Semantic).with_tags(["pattern"]))
            .await
            .unwrap();
        assert_eq!(found[0].id, durable_entry.id);
    }

    #[tokio::test]
    async fn test_eviction_discards_low_importance() {
        let (store, durable) = test_store(3);
        let mut ids = Vec::new();
        for imp in [0.1, 0.2, 0.3, 0.4] {
            let e = MemoryEntry::new(MemoryType::Working, "a", json!(imp), imp);
            ids.push(e.id.clone());
            store.store(e).await.unwrap();
        }
        assert_eq!(store.working_len().await, 3);
        assert!(store.get(&ids[0]).await.unwrap().is_none());
        assert!(durable.get(&ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_persists_valuable_entry() {
        let (store, durable) = test_store(3);
        let mut ids = Vec::new();
        for imp in [0.6, 0.65, 0.68, 0.69] {
            let e = MemoryEntry::new(MemoryType::Working, "a", json!(imp), imp).with_tags(["pattern"]);
            ids.push(e.id.clone());
            store.store(e).await.unwrap();
        }
        assert_eq!(store.working_len().await, 3);
        let persisted = durable.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(persisted.memory_type, MemoryType::Semantic);
    }

    #[tokio::test]
    async fn test_eviction_breaks_ties_by_last_access() {
        let (store, _) = test_store(2);
        let mut old = MemoryEntry::new(MemoryType::Working, "a", json!(1), 0.3);
        old.last_accessed_at = Utc::now() - chrono::Duration::minutes(5);
        let recent = MemoryEntry::new(MemoryType::Working, "a", json!(2), 0.3);
        store.store(old.clone()).await.unwrap();
        store.store(recent.clone()).await.unwrap();
        store
            .store(MemoryEntry::new(MemoryType::Working, "a", json!(3), 0.3))
            .await
            .unwrap();
        assert!(store.get(&old.id).await.unwrap().is_none());
        assert!(store.get(&recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_private_visibility() {
        let (store, _) = test_store(10);
        store
            .store(MemoryEntry::new(MemoryType::Working, "alice", json!("mine"), 0.5).with_tags(["t"]))
            .await
            .unwrap();
        store
            .store(
                MemoryEntry::new(MemoryType::Working, "alice", json!("ours"), 0.5)
                    .with_tags(["t"])
                    .with_access(AccessLevel::Public),
            )
            .await
            .unwrap();

        let alice = store.retrieve(&MemoryQuery::new("alice").with_tags(["t"])).await.unwrap();
        assert_eq!(alice.len(), 2);
        let bob = store.retrieve(&MemoryQuery::new("bob").with_tags(["t"])).await.unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].content, json!("ours"));
    }

    #[tokio::test]
    async fn test_retrieve_orders_and_limits_across_tiers() {
        let (store, _) = test_store(10);
        for (tier, imp) in [
            (MemoryType::Working, 0.3),
            (MemoryType::Episodic, 0.9),
            (MemoryType::Semantic, 0.6),
        ] {
            store
                .store(MemoryEntry::new(tier, "a", json!(imp), imp).with_context("project", json!("p")))
                .await
                .unwrap();
        }
        let found = store
            .retrieve(&MemoryQuery::new("a").with_context("project", json!("p")).limit(2))
            .await
            .unwrap();
        let imps: Vec<f64> = found.iter().map(|e| e.importance).collect();
        assert_eq!(imps, vec![0.9, 0.6]);
    }

    #[tokio::test]
    async fn test_update_working_and_durable() {
        let (store, _) = test_store(10);
        let w = MemoryEntry::new(MemoryType::Working, "a", json!("w"), 0.3);
        let d = MemoryEntry::new(MemoryType::Episodic, "a", json!("d"), 0.3);
        store.store(w.clone()).await.unwrap();
        store.store(d.clone()).await.unwrap();

        let update = MemoryUpdate {
            importance: Some(0.8),
            ..Default::default()
        };
        assert!(store.update(&w.id, &update).await.unwrap());
        assert!(store.update(&d.id, &update).await.unwrap());
        assert!(!store.update("missing", &update).await.unwrap());

        assert_eq!(store.get(&w.id).await.unwrap().unwrap().version, 2);
        assert_eq!(store.get(&d.id).await.unwrap().unwrap().importance, 0.8);

        let bad = MemoryUpdate {
            importance: Some(1.2),
            ..Default::default()
        };
        assert!(store.update(&w.id, &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_consolidation_promotes_by_tag() {
        let (store, durable) = test_store(10);
        let interaction = MemoryEntry::new(MemoryType::Working, "a", json!(1), 0.9).with_tags(["interaction"]);
        let pattern = MemoryEntry::new(MemoryType::Working, "a", json!(2), 0.8).with_tags(["pattern"]);
        let procedure = MemoryEntry::new(MemoryType::Working, "a", json!(3), 0.75).with_tags(["procedure"]);
        let minor = MemoryEntry::new(MemoryType::Working, "a", json!(4), 0.7).with_tags(["pattern"]);
        for e in [&interaction, &pattern, &procedure, &minor] {
            store.store(e.clone()).await.unwrap();
        }

        assert_eq!(store.consolidate().await.unwrap(), 3);
        assert_eq!(store.working_len().await, 1);
        assert_eq!(durable.get(&interaction.id).await.unwrap().unwrap().memory_type, MemoryType::Episodic);
        assert_eq!(durable.get(&pattern.id).await.unwrap().unwrap().memory_type, MemoryType::Semantic);
        assert_eq!(durable.get(&procedure.id).await.unwrap().unwrap().memory_type, MemoryType::Procedural);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats, MemoryStats { working: 1, episodic: 1, semantic: 1, procedural: 1 });
    }

    #[tokio::test]
    async fn test_rejects_invalid_importance() {
        let (store, _) = test_store(10);
        let mut e = MemoryEntry::new(MemoryType::Working, "a", json!(1), 0.5);
        e.importance = 1.5;
        assert!(matches!(store.store(e).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_promoted_id_cannot_return_to_working() {
        let (store, _) = test_store(10);
        let entry = MemoryEntry::new(MemoryType::Working, "a", json!("learned"), 0.9).with_tags(["pattern"]);
        store.store(entry.clone()).await.unwrap();
        assert_eq!(store.consolidate().await.unwrap(), 1);

        assert!(matches!(store.store(entry.clone()).await, Err(Error::Validation(_))));
        assert_eq!(store.working_len().await, 0);

        let found = store.retrieve(&MemoryQuery::new("a").with_tags(["pattern"])).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, entry.id);
        assert_eq!(found[0].memory_type, MemoryType::Semantic);
    }

    #[tokio::test]
    async fn test_durable_store_promotes_working_copy() {
        let (store, durable) = test_store(10);
        let mut entry = MemoryEntry::new(MemoryType::Working, "a", json!("draft"), 0.4).with_tags(["t"]);
        assert!(store.store(entry.clone()).await.unwrap());

        entry.memory_type = MemoryType::Semantic;
        assert!(!store.store(entry.clone()).await.unwrap());
        assert_eq!(store.working_len().await, 0);
        assert_eq!(durable.get(&entry.id).await.unwrap().unwrap().memory_type, MemoryType::Semantic);

        let found = store.retrieve(&MemoryQuery::new("a").with_tags(["t"])).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_update_leaves_version() {
        let (store, _) = test_store(10);
        let entry = MemoryEntry::new(MemoryType::Working, "a", json!(1), 0.5);
        store.store(entry.clone()).await.unwrap();

        assert!(store.update(&entry.id, &MemoryUpdate::default()).await.unwrap());
        assert!(!store.update("missing", &MemoryUpdate::default()).await.unwrap());
        assert_eq!(store.get(&entry.id).await.unwrap().unwrap().version, entry.version);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consolidation_loop_promotes_on_tick() {
        let durable = Arc::new(InMemoryStorage::new());
        let config = MemoryConfig {
            consolidation_interval_secs: 1,
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(config, durable.clone()));
        let entry = MemoryEntry::new(MemoryType::Working, "a", json!("keep"), 0.8).with_tags(["procedure"]);
        store.store(entry.clone()).await.unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(store.clone().run_consolidation_loop(shutdown_tx.subscribe()));

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(store.working_len().await, 0);
        assert_eq!(durable.get(&entry.id).await.unwrap().unwrap().memory_type, MemoryType::Procedural);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    struct RecordingHook(Mutex<Vec<String>>);

    #[async_trait]
    impl MemoryShareHook for RecordingHook {
        async fn on_shared(&self, entry: &MemoryEntry) {
            self.0.lock().unwrap().push(entry.id.clone());
        }
    }

    #[tokio::test]
    async fn test_share_hook_only_for_shared_entries() {
        let (store, _) = test_store(10);
        let hook = Arc::new(RecordingHook(Mutex::new(Vec::new())));
        store.set_share_hook(hook.clone());

        let private = MemoryEntry::new(MemoryType::Working, "a", json!(1), 0.5);
        let shared = MemoryEntry::new(MemoryType::Working, "a", json!(2), 0.5).with_access(AccessLevel::Shared);
        store.store(private).await.unwrap();
        store.store(shared.clone()).await.unwrap();

        assert_eq!(*hook.0.lock().unwrap(), vec![shared.id]);
    }
}
