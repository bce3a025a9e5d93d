pub mod durable;
pub mod entry;
pub mod memory;
pub mod sqlite;

pub use durable::{DurableStorage, InMemoryStorage};
pub use entry::{AccessLevel, MemoryEntry, MemoryFilter, MemoryType, MemoryUpdate};
pub use memory::{MemoryQuery, MemoryShareHook, MemoryStats, MemoryStore};
pub use sqlite::SqliteStorage;
