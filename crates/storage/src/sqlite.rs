use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::durable::DurableStorage;
use crate::entry::{rank, AccessLevel, MemoryEntry, MemoryFilter, MemoryType, MemoryUpdate};

/// SQLite-backed durable tiers. One row per entry; structured fields are stored as JSON text.
#[derive(Clone)]
pub struct SqliteStorage {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the memory database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("Failed to open memory db: {}", e)))?;

        // WAL keeps readers from blocking the consolidation writer
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to open memory db: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memory_entries (
                id TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                access_level TEXT NOT NULL DEFAULT 'private',
                importance REAL NOT NULL DEFAULT 0.5,
                content TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                context TEXT NOT NULL DEFAULT '{}',
                related TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_memory_tier ON memory_entries(tier);
            CREATE INDEX IF NOT EXISTS idx_memory_owner ON memory_entries(owner_id);
            CREATE INDEX IF NOT EXISTS idx_memory_importance ON memory_entries(importance);
            ",
        )
        .map_err(|e| Error::Storage(format!("Failed to init memory schema: {}", e)))?;

        debug!("Memory store schema initialized");
        Ok(())
    }

    fn put_inner(conn: &Connection, tier: MemoryType, entry: &MemoryEntry) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO memory_entries (id, tier, owner_id, access_level, importance,
                content, tags, context, related, created_at, last_accessed_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.id,
                tier.as_str(),
                entry.owner_id,
                entry.access_level.as_str(),
                entry.importance,
                serde_json::to_string(&entry.content)?,
                serde_json::to_string(&entry.tags)?,
                serde_json::to_string(&entry.context)?,
                serde_json::to_string(&entry.related_memories)?,
                entry.created_at.to_rfc3339(),
                entry.last_accessed_at.to_rfc3339(),
                entry.version as i64,
            ],
        )
        .map_err(|e| Error::Storage(format!("Insert error: {}", e)))?;
        Ok(())
    }

    fn get_inner(conn: &Connection, id: &str) -> Result<Option<MemoryEntry>> {
        let raw = conn
            .query_row(
                "SELECT * FROM memory_entries WHERE id = ?1",
                params![id],
                RawRow::from_row,
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;
        raw.map(RawRow::into_entry).transpose()
    }
}

/// Column values as read, before JSON decoding.
struct RawRow {
    id: String,
    tier: String,
    owner_id: String,
    access_level: String,
    importance: f64,
    content: String,
    tags: String,
    context: String,
    related: String,
    created_at: String,
    last_accessed_at: String,
    version: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            tier: row.get("tier")?,
            owner_id: row.get("owner_id")?,
            access_level: row.get("access_level")?,
            importance: row.get("importance")?,
            content: row.get("content")?,
            tags: row.get("tags")?,
            context: row.get("context")?,
            related: row.get("related")?,
            created_at: row.get("created_at")?,
            last_accessed_at: row.get("last_accessed_at")?,
            version: row.get("version")?,
        })
    }

    fn into_entry(self) -> Result<MemoryEntry> {
        let memory_type = MemoryType::from_str(&self.tier)
            .ok_or_else(|| Error::Storage(format!("Unknown memory tier '{}'", self.tier)))?;
        Ok(MemoryEntry {
            id: self.id,
            memory_type,
            content: serde_json::from_str(&self.content)?,
            importance: self.importance,
            owner_id: self.owner_id,
            access_level: AccessLevel::from_str(&self.access_level).unwrap_or_default(),
            tags: serde_json::from_str(&self.tags)?,
            context: serde_json::from_str(&self.context)?,
            created_at: parse_ts(&self.created_at)?,
            last_accessed_at: parse_ts(&self.last_accessed_at)?,
            version: self.version.max(0) as u64,
            related_memories: serde_json::from_str(&self.related)?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Bad timestamp '{}': {}", s, e)))
}

#[async_trait]
impl DurableStorage for SqliteStorage {
    async fn put(&self, tier: MemoryType, entry: &MemoryEntry) -> Result<()> {
        let conn = self.conn();
        Self::put_inner(&conn, tier, entry)?;
        debug!(id = %entry.id, tier = %tier, "Memory entry persisted");
        Ok(())
    }

    async fn query(&self, tier: MemoryType, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM memory_entries WHERE tier = ?1
                 ORDER BY importance DESC, last_accessed_at DESC",
            )
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;

        // Collect rows first so the statement's borrow ends before decoding
        let raw: Vec<RawRow> = stmt
            .query_map(params![tier.as_str()], RawRow::from_row)
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| Error::Storage(format!("Row error: {}", e)))?;

        let mut out = Vec::new();
        for row in raw {
            let entry = row.into_entry()?;
            if filter.matches(&entry) {
                out.push(entry);
            }
        }
        out.sort_by(rank);
        Ok(out)
    }

    async fn update(&self, id: &str, update: &MemoryUpdate) -> Result<Option<MemoryEntry>> {
        let conn = self.conn();
        let Some(mut entry) = Self::get_inner(&conn, id)? else {
            return Ok(None);
        };
        update.apply(&mut entry);
        Self::put_inner(&conn, entry.memory_type, &entry)?;
        Ok(Some(entry))
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let conn = self.conn();
        Self::get_inner(&conn, id)
    }

    async fn count(&self, tier: MemoryType) -> Result<usize> {
        let conn = self.conn();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_entries WHERE tier = ?1",
                params![tier.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(format!("Count error: {}", e)))?;
        Ok(n.max(0) as usize)
    }
}
