use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// What a full mailbox does with a new message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// `send` returns false and the message is not enqueued.
    #[default]
    Reject,
    /// The oldest queued message is discarded to make room.
    DropOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Mailbox depth above which an agent is reported as a bottleneck.
    #[serde(default = "default_bottleneck_threshold")]
    pub bottleneck_threshold: usize,
    #[serde(default = "default_response_time_threshold_ms")]
    pub response_time_threshold_ms: u64,
    /// 0 means unbounded.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Messages kept per conversation thread for context lookups.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub default_request_timeout_secs: u64,
    /// Request timeouts between the same pair before a loop is reported.
    #[serde(default = "default_loop_timeout_threshold")]
    pub loop_timeout_threshold: u32,
    /// Dispatch latencies kept for the rolling average.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_bottleneck_threshold() -> usize {
    100
}

fn default_response_time_threshold_ms() -> u64 {
    5000
}

fn default_mailbox_capacity() -> usize {
    1000
}

fn default_history_limit() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_loop_timeout_threshold() -> u32 {
    3
}

fn default_latency_window() -> usize {
    100
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            bottleneck_threshold: default_bottleneck_threshold(),
            response_time_threshold_ms: default_response_time_threshold_ms(),
            mailbox_capacity: default_mailbox_capacity(),
            overflow_policy: OverflowPolicy::default(),
            history_limit: default_history_limit(),
            default_request_timeout_secs: default_request_timeout_secs(),
            loop_timeout_threshold: default_loop_timeout_threshold(),
            latency_window: default_latency_window(),
        }
    }
}

impl BusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn response_time_threshold(&self) -> Duration {
        Duration::from_millis(self.response_time_threshold_ms)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_secs(self.default_request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_supervision_interval_secs")]
    pub supervision_interval_secs: u64,
    /// Stalls that are retried; the next one is terminal.
    #[serde(default = "default_max_stall_retries")]
    pub max_stall_retries: u32,
    /// Agents silent for twice this long are reported stalled.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,
}

fn default_stall_threshold_secs() -> u64 {
    300
}

fn default_supervision_interval_secs() -> u64 {
    10
}

fn default_max_stall_retries() -> u32 {
    3
}

fn default_task_timeout_secs() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: default_stall_threshold_secs(),
            supervision_interval_secs: default_supervision_interval_secs(),
            max_stall_retries: default_max_stall_retries(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            default_task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn supervision_interval(&self) -> Duration {
        Duration::from_secs(self.supervision_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MemoryBackend {
    #[default]
    Sqlite,
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(default = "default_working_memory_limit")]
    pub working_memory_limit: usize,
    /// Evicted working entries above this importance are persisted, not discarded.
    #[serde(default = "default_persist_threshold")]
    pub persist_threshold: f64,
    /// Working entries above this importance are promoted by the consolidation sweep.
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: f64,
    #[serde(default = "default_consolidation_interval_secs")]
    pub consolidation_interval_secs: u64,
    #[serde(default)]
    pub backend: MemoryBackend,
}

fn default_working_memory_limit() -> usize {
    100
}

fn default_persist_threshold() -> f64 {
    0.5
}

fn default_consolidation_threshold() -> f64 {
    0.7
}

fn default_consolidation_interval_secs() -> u64 {
    300
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_memory_limit: default_working_memory_limit(),
            persist_threshold: default_persist_threshold(),
            consolidation_threshold: default_consolidation_threshold(),
            consolidation_interval_secs: default_consolidation_interval_secs(),
            backend: MemoryBackend::default(),
        }
    }
}

impl MemoryConfig {
    pub fn consolidation_interval(&self) -> Duration {
        Duration::from_secs(self.consolidation_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Upper bound on how long queued mail waits when no wakeup arrives.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_min_reasoning_confidence")]
    pub min_reasoning_confidence: f64,
    /// Reject task requests when the reasoning engine is unavailable.
    #[serde(default)]
    pub require_reasoning: bool,
}

fn default_dispatch_interval_ms() -> u64 {
    100
}

fn default_min_reasoning_confidence() -> f64 {
    0.5
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            min_reasoning_confidence: default_min_reasoning_confidence(),
            require_reasoning: false,
        }
    }
}

impl AgentDefaults {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub agents: AgentDefaults,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let config: Config = match ext.as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json5") => json5::from_str(&content)
                .map_err(|e| Error::Config(format!("Invalid json5 in {}: {}", path.display(), e)))?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        for (name, v) in [
            ("memory.persistThreshold", m.persist_threshold),
            ("memory.consolidationThreshold", m.consolidation_threshold),
            ("agents.minReasoningConfidence", self.agents.min_reasoning_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::Config(format!("{} must be within [0, 1], got {}", name, v)));
            }
        }
        if m.working_memory_limit == 0 {
            return Err(Error::Config("memory.workingMemoryLimit must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bus.heartbeat_interval_secs, 30);
        assert_eq!(cfg.bus.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(cfg.scheduler.max_stall_retries, 3);
        assert_eq!(cfg.memory.persist_threshold, 0.5);
        assert_eq!(cfg.memory.consolidation_threshold, 0.7);
        assert_eq!(cfg.memory.backend, MemoryBackend::Sqlite);
    }

    #[test]
    fn test_camel_case_fields() {
        let raw = r#"{
  "bus": { "mailboxCapacity": 4, "overflowPolicy": "dropOldest" },
  "memory": { "workingMemoryLimit": 8, "backend": "inMemory" }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.bus.mailbox_capacity, 4);
        assert_eq!(cfg.bus.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(cfg.memory.working_memory_limit, 8);
        assert_eq!(cfg.memory.backend, MemoryBackend::InMemory);
    }

    #[test]
    fn test_save_and_load_by_extension() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.scheduler.stall_threshold_secs = 42;
        let json_path = dir.path().join("config.json");
        cfg.save(&json_path).unwrap();
        assert_eq!(Config::load(&json_path).unwrap().scheduler.stall_threshold_secs, 42);

        let yaml_path = dir.path().join("config.yaml");
        std::fs::write(&yaml_path, "scheduler:\n  stallThresholdSecs: 7\n").unwrap();
        assert_eq!(Config::load(&yaml_path).unwrap().scheduler.stall_threshold_secs, 7);

        let json5_path = dir.path().join("config.json5");
        std::fs::write(&json5_path, "{ memory: { workingMemoryLimit: 3, }, }").unwrap();
        assert_eq!(Config::load(&json5_path).unwrap().memory.working_memory_limit, 3);
    }

    #[test]
    fn test_load_or_default_reads_from_base_dir() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().join("home"));
        assert_eq!(Config::load_or_default(&paths).unwrap().scheduler.max_stall_retries, 3);

        let mut cfg = Config::default();
        cfg.scheduler.max_stall_retries = 9;
        cfg.save(&paths.config_file()).unwrap();
        assert_eq!(Config::load_or_default(&paths).unwrap().scheduler.max_stall_retries, 9);
        assert!(paths.memory_db().starts_with(dir.path().join("home").join("data")));
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "memory": { "persistThreshold": 1.5 } }"#).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
