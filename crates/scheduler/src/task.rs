use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Checkpoints kept per task; older ones are dropped.
const MAX_CHECKPOINTS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl TaskPriority {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(TaskPriority::Critical),
            "high" => Some(TaskPriority::High),
            "normal" => Some(TaskPriority::Normal),
            "low" => Some(TaskPriority::Low),
            "background" => Some(TaskPriority::Background),
            _ => None,
        }
    }
}

/// Status of a scheduled task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, waiting for resources or a retry.
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    /// No progress within the threshold; waiting on the escalation policy.
    Stalled,
    /// Cancelled explicitly.
    Interrupted,
}

impl TaskStatus {
    /// No transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Interrupted
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
            TaskStatus::Stalled => write!(f, "stalled"),
            TaskStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Why a running task was declared stalled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StallCause {
    /// Nothing reported within the stall threshold.
    NoProgress,
    /// Running longer than the task's own timeout.
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub at: DateTime<Utc>,
    pub progress: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub start_time: Option<DateTime<Utc>>,
    pub last_progress_time: Option<DateTime<Utc>>,
    pub checkpoints: Vec<Checkpoint>,
    pub progress: f64,
    pub retry_count: u32,
    pub stall_count: u32,
    pub last_stall_cause: Option<StallCause>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub actual_completion: Option<DateTime<Utc>>,
}

impl TaskMetrics {
    pub(crate) fn record_checkpoint(&mut self, at: DateTime<Utc>, progress: f64) {
        self.checkpoints.push(Checkpoint { at, progress });
        if self.checkpoints.len() > MAX_CHECKPOINTS {
            let excess = self.checkpoints.len() - MAX_CHECKPOINTS;
            self.checkpoints.drain(..excess);
        }
        self.progress = progress;
        self.last_progress_time = Some(at);

        // Linear extrapolation from elapsed time and fraction done
        if let Some(start) = self.start_time {
            if progress > 0.0 {
                let elapsed_ms = (at - start).num_milliseconds().max(0) as f64;
                let total_ms = elapsed_ms / progress;
                self.estimated_completion =
                    Some(start + chrono::Duration::milliseconds(total_ms as i64));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub agent_id: String,
    pub priority: TaskPriority,
    pub dependencies: BTreeSet<String>,
    pub resources: BTreeSet<String>,
    pub timeout: Duration,
    pub status: TaskStatus,
    pub metrics: TaskMetrics,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: &str, agent_id: &str, timeout: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            priority: TaskPriority::Normal,
            dependencies: BTreeSet::new(),
            resources: BTreeSet::new(),
            timeout,
            status: TaskStatus::Pending,
            metrics: TaskMetrics::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources.extend(resources.into_iter().map(Into::into));
        self
    }

    /// The stall predicate for a running task.
    pub fn stall_cause_at(&self, now: DateTime<Utc>, stall_threshold: Duration) -> Option<StallCause> {
        if self.status != TaskStatus::Running {
            return None;
        }
        let since = |t: DateTime<Utc>| (now - t).to_std().unwrap_or(Duration::ZERO);

        if let Some(start) = self.metrics.start_time {
            if since(start) > self.timeout {
                return Some(StallCause::TimedOut);
            }
        }
        if let Some(last) = self.metrics.last_progress_time.or(self.metrics.start_time) {
            if since(last) > stall_threshold {
                return Some(StallCause::NoProgress);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(timeout_secs: u64) -> Task {
        let mut t = Task::new("t", "a", Duration::from_secs(timeout_secs));
        let now = Utc::now();
        t.status = TaskStatus::Running;
        t.metrics.start_time = Some(now);
        t.metrics.last_progress_time = Some(now);
        t
    }

    #[test]
    fn test_stall_predicate_no_progress() {
        let t = running(3600);
        let start = t.metrics.start_time.unwrap();
        let threshold = Duration::from_secs(60);
        assert_eq!(t.stall_cause_at(start + chrono::Duration::seconds(30), threshold), None);
        assert_eq!(
            t.stall_cause_at(start + chrono::Duration::seconds(61), threshold),
            Some(StallCause::NoProgress)
        );
    }

    #[test]
    fn test_stall_predicate_timeout_wins() {
        let t = running(10);
        let start = t.metrics.start_time.unwrap();
        assert_eq!(
            t.stall_cause_at(start + chrono::Duration::seconds(11), Duration::from_secs(60)),
            Some(StallCause::TimedOut)
        );
    }

    #[test]
    fn test_pending_never_stalls() {
        let mut t = running(1);
        t.status = TaskStatus::Pending;
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(t.stall_cause_at(later, Duration::from_secs(1)), None);
    }

    #[test]
    fn test_estimated_completion() {
        let mut m = TaskMetrics::default();
        let start = Utc::now();
        m.start_time = Some(start);
        m.record_checkpoint(start + chrono::Duration::seconds(10), 0.25);
        let eta = m.estimated_completion.unwrap();
        assert_eq!((eta - start).num_seconds(), 40);
        assert_eq!(m.checkpoints.len(), 1);
    }

    #[test]
    fn test_checkpoints_are_bounded() {
        let mut m = TaskMetrics::default();
        let start = Utc::now();
        for i in 0..150 {
            m.record_checkpoint(start, i as f64 / 150.0);
        }
        assert_eq!(m.checkpoints.len(), MAX_CHECKPOINTS);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Stalled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
