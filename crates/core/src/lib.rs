pub mod config;
pub mod error;
pub mod message;
pub mod paths;

pub use config::{AgentDefaults, BusConfig, Config, MemoryBackend, MemoryConfig, OverflowPolicy, SchedulerConfig};
pub use error::{Error, ErrorKind, Result};
pub use message::{Message, MessageCategory, MessagePriority, BROADCAST, SYSTEM_SENDER};
pub use paths::Paths;
