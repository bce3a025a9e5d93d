use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Tier of a memory entry. Only `Working` lives in process; the rest are durable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Working,
    Episodic,
    Semantic,
    Procedural,
}

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Working,
        MemoryType::Episodic,
        MemoryType::Semantic,
        MemoryType::Procedural,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Working => "working",
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "working" => Some(MemoryType::Working),
            "episodic" => Some(MemoryType::Episodic),
            "semantic" => Some(MemoryType::Semantic),
            "procedural" => Some(MemoryType::Procedural),
            _ => None,
        }
    }

    pub fn is_durable(&self) -> bool {
        !matches!(self, MemoryType::Working)
    }

    /// Durable tier a working entry is promoted into, chosen from its tags.
    pub fn classify(tags: &BTreeSet<String>) -> MemoryType {
        if tags.contains("interaction") {
            MemoryType::Episodic
        } else if tags.contains("pattern") {
            MemoryType::Semantic
        } else if tags.contains("procedure") {
            MemoryType::Procedural
        } else {
            MemoryType::Episodic
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    Private,
    Shared,
    Public,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "private",
            AccessLevel::Shared => "shared",
            AccessLevel::Public => "public",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "private" => Some(AccessLevel::Private),
            "shared" => Some(AccessLevel::Shared),
            "public" => Some(AccessLevel::Public),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: Value,
    pub importance: f64,
    pub owner_id: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub related_memories: BTreeSet<String>,
}

fn default_version() -> u64 {
    1
}

impl MemoryEntry {
    pub fn new(memory_type: MemoryType, owner_id: &str, content: Value, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            memory_type,
            content,
            importance: importance.clamp(0.0, 1.0),
            owner_id: owner_id.to_string(),
            access_level: AccessLevel::Private,
            tags: BTreeSet::new(),
            context: Map::new(),
            created_at: now,
            last_accessed_at: now,
            version: default_version(),
            related_memories: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
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

    pub fn with_access(mut self, access_level: AccessLevel) -> Self {
        self.access_level = access_level;
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn with_related(mut self, memory_id: &str) -> Self {
        self.related_memories.insert(memory_id.to_string());
        self
    }

    /// Private entries are only visible to their owner.
    pub fn visible_to(&self, requester: Option<&str>) -> bool {
        match self.access_level {
            AccessLevel::Private => requester == Some(self.owner_id.as_str()),
            AccessLevel::Shared | AccessLevel::Public => true,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.access_level != AccessLevel::Private
    }
}

/// Field-level changes applied by `update`; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    /// Merged into the existing context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<AccessLevel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_related: Vec<String>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.importance.is_none()
            && self.tags.is_none()
            && self.context.is_none()
            && self.access_level.is_none()
            && self.add_related.is_empty()
    }

    pub fn apply(&self, entry: &mut MemoryEntry) {
        if let Some(ref content) = self.content {
            entry.content = content.clone();
        }
        if let Some(importance) = self.importance {
            entry.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(ref tags) = self.tags {
            entry.tags = tags.clone();
        }
        if let Some(ref context) = self.context {
            for (k, v) in context {
                entry.context.insert(k.clone(), v.clone());
            }
        }
        if let Some(level) = self.access_level {
            entry.access_level = level;
        }
        entry
            .related_memories
            .extend(self.add_related.iter().cloned());
        entry.version += 1;
        entry.last_accessed_at = Utc::now();
    }
}

/// Matching rule shared by every tier.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    /// Every tag must be present.
    pub tags: BTreeSet<String>,
    /// Every key/value must match exactly.
    pub context: Map<String, Value>,
    /// Identity of the caller; private entries of other owners are hidden.
    pub requester: Option<String>,
}

impl MemoryFilter {
    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if !entry.visible_to(self.requester.as_deref()) {
            return false;
        }
        if !self.tags.iter().all(|t| entry.tags.contains(t)) {
            return false;
        }
        self.context
            .iter()
            .all(|(k, v)| entry.context.get(k) == Some(v))
    }
}

/// Orders by importance, then most recently accessed, both descending.
pub fn rank(a: &MemoryEntry, b: &MemoryEntry) -> std::cmp::Ordering {
    b.importance
        .total_cmp(&a.importance)
        .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
}
