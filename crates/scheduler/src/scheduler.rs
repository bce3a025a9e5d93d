use chrono::{DateTime, Utc};
use conclave_core::{Error, Result, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::heartbeat::HeartbeatMonitor;
use crate::locks::ResourceLocks;
use crate::task::{StallCause, Task, TaskPriority, TaskStatus};

/// Emitted when a running task is declared stalled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallEvent {
    pub task_id: String,
    pub agent_id: String,
    pub stall_count: u32,
    /// Time since the last progress report (or start).
    pub idle: Duration,
    pub cause: StallCause,
}

/// Outcome of applying the escalation policy to a stalled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Escalation {
    /// Requeued as pending; the caller should retry.
    Retry { retry_count: u32 },
    /// Stall budget exhausted; the task is terminal.
    Fail { status: TaskStatus },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub stalled: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub interrupted: usize,
    pub locked_resources: usize,
}

/// Registry entry. Dependency and resource sets never change after
/// registration, so cycle checks and lock calls read them without the task lock.
struct TaskSlot {
    agent_id: String,
    dependencies: BTreeSet<String>,
    resources: BTreeSet<String>,
    task: Mutex<Task>,
}

/// Task registry, resource lock table and stall supervision.
///
/// The registry, the lock table and the completion set are guarded separately.
/// A per-task lock may be taken while holding nothing else, or after the
/// registry lock has been released; never the other way round.
pub struct TaskScheduler {
    config: SchedulerConfig,
    tasks: RwLock<HashMap<String, Arc<TaskSlot>>>,
    completed: RwLock<HashSet<String>>,
    locks: ResourceLocks,
    heartbeats: HeartbeatMonitor,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let heartbeats = HeartbeatMonitor::new(config.heartbeat_interval());
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashSet::new()),
            locks: ResourceLocks::new(),
            heartbeats,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    async fn slot(&self, task_id: &str) -> Result<Arc<TaskSlot>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task '{}'", task_id)))
    }

    async fn slots(&self) -> Vec<Arc<TaskSlot>> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Register a task. Rejected if the id exists, if it would close a
    /// dependency cycle, or if any of its resources is currently held.
    pub async fn register_task(&self, mut task: Task) -> Result<()> {
        if task.task_id.trim().is_empty() {
            return Err(Error::Validation("task id must not be empty".to_string()));
        }
        if task.dependencies.contains(&task.task_id) {
            return Err(Error::CircularDependency(format!(
                "task '{}' depends on itself",
                task.task_id
            )));
        }

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(Error::DuplicateTask(task.task_id));
        }
        if reaches(&tasks, &task.dependencies, &task.task_id) {
            return Err(Error::CircularDependency(format!(
                "registering '{}' would close a dependency cycle",
                task.task_id
            )));
        }
        if let Some(held) = task.resources.iter().find(|r| self.locks.is_held(r)) {
            return Err(Error::ResourceUnavailable(format!(
                "'{}' is held by '{}'",
                held,
                self.locks.holder(held).unwrap_or_default()
            )));
        }

        for resource in &task.resources {
            self.locks.ensure(resource);
        }

        task.status = TaskStatus::Pending;
        debug!(
            task_id = %task.task_id,
            agent_id = %task.agent_id,
            dependencies = task.dependencies.len(),
            resources = task.resources.len(),
            "Task registered"
        );
        let id = task.task_id.clone();
        let slot = TaskSlot {
            agent_id: task.agent_id.clone(),
            dependencies: task.dependencies.clone(),
            resources: task.resources.clone(),
            task: Mutex::new(task),
        };
        tasks.insert(id, Arc::new(slot));
        Ok(())
    }

    /// Try to take every resource of the task at once, in sorted order.
    /// `false` means nothing was taken and the task stays pending.
    pub async fn acquire_resources(&self, task_id: &str) -> Result<bool> {
        let slot = self.slot(task_id).await?;
        Ok(self.locks.try_acquire_all(task_id, &slot.resources))
    }

    /// Release whatever the task still holds. Safe to call repeatedly.
    pub fn release_resources(&self, task_id: &str) -> Vec<String> {
        let released = self.locks.release_all(task_id);
        if !released.is_empty() {
            debug!(task_id = %task_id, resources = ?released, "Resources released");
        }
        released
    }

    pub fn resource_holder(&self, resource: &str) -> Option<String> {
        self.locks.holder(resource)
    }

    /// Resources currently held by the task.
    pub fn held_resources(&self, task_id: &str) -> Vec<String> {
        self.locks.held_by(task_id)
    }

    pub async fn dependencies_met(&self, task_id: &str) -> Result<bool> {
        let slot = self.slot(task_id).await?;
        let completed = self.completed.read().await;
        Ok(slot.dependencies.iter().all(|d| completed.contains(d)))
    }

    /// Move a pending task to running. Returns `false` while dependencies are
    /// unfinished or resources cannot all be taken.
    pub async fn start_task(&self, task_id: &str) -> Result<bool> {
        self.start_task_at(task_id, Utc::now()).await
    }

    pub async fn start_task_at(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let slot = self.slot(task_id).await?;
        if !self.dependencies_met(task_id).await? {
            debug!(task_id = %task_id, "Dependencies not yet completed");
            return Ok(false);
        }

        let mut task = slot.task.lock().await;
        if task.status != TaskStatus::Pending {
            return Err(Error::Validation(format!(
                "task '{}' is {}, expected pending",
                task_id, task.status
            )));
        }
        if !self.locks.try_acquire_all(task_id, &slot.resources) {
            return Ok(false);
        }

        task.status = TaskStatus::Running;
        task.metrics.start_time = Some(now);
        task.metrics.last_progress_time = Some(now);
        info!(task_id = %task_id, agent_id = %slot.agent_id, "Task started");
        Ok(true)
    }

    /// Record progress in `[0, 1]`; the stall predicate is re-evaluated afterwards.
    pub async fn update_progress(&self, task_id: &str, progress: f64) -> Result<Option<StallEvent>> {
        self.update_progress_at(task_id, progress, Utc::now()).await
    }

    pub async fn update_progress_at(
        &self,
        task_id: &str,
        progress: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<StallEvent>> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(Error::Validation(format!(
                "progress must be within [0, 1], got {}",
                progress
            )));
        }
        let slot = self.slot(task_id).await?;
        let mut task = slot.task.lock().await;
        if task.status != TaskStatus::Running {
            return Err(Error::Validation(format!(
                "task '{}' is {}, progress only applies to running tasks",
                task_id, task.status
            )));
        }

        task.metrics.record_checkpoint(now, progress);
        let threshold = self.config.stall_threshold();
        Ok(task
            .stall_cause_at(now, threshold)
            .map(|cause| self.mark_stalled(&mut task, cause, now)))
    }

    fn mark_stalled(&self, task: &mut Task, cause: StallCause, now: DateTime<Utc>) -> StallEvent {
        let idle = task
            .metrics
            .last_progress_time
            .or(task.metrics.start_time)
            .and_then(|t| (now - t).to_std().ok())
            .unwrap_or(Duration::ZERO);

        task.metrics.stall_count += 1;
        task.metrics.last_stall_cause = Some(cause);
        task.status = TaskStatus::Stalled;
        self.locks.release_all(&task.task_id);

        warn!(
            task_id = %task.task_id,
            agent_id = %task.agent_id,
            stall_count = task.metrics.stall_count,
            idle_secs = idle.as_secs(),
            cause = ?cause,
            "Task stalled"
        );

        StallEvent {
            task_id: task.task_id.clone(),
            agent_id: task.agent_id.clone(),
            stall_count: task.metrics.stall_count,
            idle,
            cause,
        }
    }

    /// Apply the stall predicate to every running task.
    pub async fn check_stalls(&self) -> Vec<StallEvent> {
        self.check_stalls_at(Utc::now()).await
    }

    pub async fn check_stalls_at(&self, now: DateTime<Utc>) -> Vec<StallEvent> {
        let threshold = self.config.stall_threshold();
        let mut events = Vec::new();
        for slot in self.slots().await {
            let mut task = slot.task.lock().await;
            if let Some(cause) = task.stall_cause_at(now, threshold) {
                events.push(self.mark_stalled(&mut task, cause, now));
            }
        }
        events.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        events
    }

    /// Retry a stalled task while its stall budget lasts, fail it afterwards.
    pub async fn escalate(&self, task_id: &str) -> Result<Escalation> {
        self.escalate_at(task_id, Utc::now()).await
    }

    pub async fn escalate_at(&self, task_id: &str, now: DateTime<Utc>) -> Result<Escalation> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.task.lock().await;
        if task.status != TaskStatus::Stalled {
            return Err(Error::Validation(format!(
                "task '{}' is {}, only stalled tasks escalate",
                task_id, task.status
            )));
        }

        if task.metrics.stall_count <= self.config.max_stall_retries {
            task.status = TaskStatus::Pending;
            task.metrics.retry_count += 1;
            task.metrics.last_progress_time = Some(now);
            info!(
                task_id = %task_id,
                retry_count = task.metrics.retry_count,
                "Stalled task requeued"
            );
            return Ok(Escalation::Retry {
                retry_count: task.metrics.retry_count,
            });
        }

        let status = match task.metrics.last_stall_cause {
            Some(StallCause::TimedOut) => TaskStatus::Timeout,
            _ => TaskStatus::Failed,
        };
        task.status = status;
        task.metrics.actual_completion = Some(now);
        self.locks.release_all(task_id);
        warn!(
            task_id = %task_id,
            stall_count = task.metrics.stall_count,
            status = %status,
            "Stall budget exhausted"
        );
        Ok(Escalation::Fail { status })
    }

    /// Terminal success or failure. Releases resources; a successful task
    /// unblocks the tasks that depend on it.
    pub async fn finish_task(&self, task_id: &str, success: bool) -> Result<Task> {
        let slot = self.slot(task_id).await?;
        let finished = {
            let mut task = slot.task.lock().await;
            if task.status.is_terminal() {
                return Err(Error::Validation(format!(
                    "task '{}' is already {}",
                    task_id, task.status
                )));
            }
            task.status = if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            let now = Utc::now();
            task.metrics.actual_completion = Some(now);
            if success {
                task.metrics.record_checkpoint(now, 1.0);
            }
            self.locks.release_all(task_id);
            task.clone()
        };

        if success {
            self.completed.write().await.insert(task_id.to_string());
        }
        info!(task_id = %task_id, status = %finished.status, "Task finished");
        Ok(finished)
    }

    /// Explicit cancellation from any non-terminal state.
    pub async fn interrupt_task(&self, task_id: &str) -> Result<Task> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.task.lock().await;
        if task.status.is_terminal() {
            return Err(Error::Validation(format!(
                "task '{}' is already {}",
                task_id, task.status
            )));
        }
        task.status = TaskStatus::Interrupted;
        task.metrics.actual_completion = Some(Utc::now());
        self.locks.release_all(task_id);
        info!(task_id = %task_id, "Task interrupted");
        Ok(task.clone())
    }

    /// Drop a task from the registry, releasing anything it still holds.
    pub async fn remove_task(&self, task_id: &str) -> Option<Task> {
        let slot = self.tasks.write().await.remove(task_id)?;
        self.locks.release_all(task_id);
        let task = slot.task.lock().await.clone();
        debug!(task_id = %task_id, status = %task.status, "Task removed");
        Some(task)
    }

    /// Re-rank a task by time pressure and stall history.
    pub async fn adjust_priority(&self, task_id: &str) -> Result<TaskPriority> {
        self.adjust_priority_at(task_id, Utc::now()).await
    }

    pub async fn adjust_priority_at(&self, task_id: &str, now: DateTime<Utc>) -> Result<TaskPriority> {
        let slot = self.slot(task_id).await?;
        let mut task = slot.task.lock().await;

        let timeout_ms = task.timeout.as_millis() as f64;
        let pressure = task.metrics.estimated_completion.map(|eta| {
            if timeout_ms <= 0.0 {
                0.0
            } else {
                (eta - now).num_milliseconds() as f64 / timeout_ms
            }
        });
        let under = |limit: f64| pressure.is_some_and(|p| p < limit);

        let priority = if under(0.2) || task.metrics.stall_count > 0 {
            TaskPriority::Critical
        } else if under(0.5) {
            TaskPriority::High
        } else if task.metrics.retry_count > 0 {
            TaskPriority::Normal
        } else {
            task.priority
        };

        if priority != task.priority {
            debug!(task_id = %task_id, from = ?task.priority, to = ?priority, "Priority adjusted");
            task.priority = priority;
        }
        Ok(priority)
    }

    pub async fn record_heartbeat(&self, agent_id: &str) {
        self.heartbeats.record(agent_id).await;
    }

    pub async fn record_heartbeat_at(&self, agent_id: &str, at: DateTime<Utc>) {
        self.heartbeats.record_at(agent_id, at).await;
    }

    pub async fn forget_agent(&self, agent_id: &str) {
        self.heartbeats.forget(agent_id).await;
    }

    /// Agents silent for more than twice the heartbeat interval. Informational only.
    pub async fn check_agent_health(&self) -> Vec<String> {
        self.check_agent_health_at(Utc::now()).await
    }

    pub async fn check_agent_health_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.heartbeats.stalled_agents_at(now).await
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        let slot = self.tasks.read().await.get(task_id).cloned()?;
        let task = slot.task.lock().await.clone();
        Some(task)
    }

    /// Tasks owned by `agent_id`, optionally restricted to one status, by id.
    pub async fn tasks_for_agent(&self, agent_id: &str, status: Option<TaskStatus>) -> Vec<Task> {
        let mut out = Vec::new();
        for slot in self.slots().await {
            if slot.agent_id != agent_id {
                continue;
            }
            let task = slot.task.lock().await;
            if status.map_or(true, |s| task.status == s) {
                out.push(task.clone());
            }
        }
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    pub async fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary::default();
        for slot in self.slots().await {
            let status = slot.task.lock().await.status;
            summary.total += 1;
            match status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Stalled => summary.stalled += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Timeout => summary.timeout += 1,
                TaskStatus::Interrupted => summary.interrupted += 1,
            }
        }
        summary.locked_resources = self.locks.snapshot().len();
        summary
    }

    /// Periodic stall and agent-health sweep. Escalation is left to the owning agents.
    pub async fn run_supervision_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.supervision_interval();
        info!(interval_secs = period.as_secs(), "Task supervision started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stalls = self.check_stalls().await;
                    if !stalls.is_empty() {
                        info!(count = stalls.len(), "Stalled tasks detected");
                    }
                    for agent_id in self.check_agent_health().await {
                        warn!(agent_id = %agent_id, "Agent heartbeat overdue");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Task supervision shutting down");
                    break;
                }
            }
        }
    }
}

/// Depth-first walk from `start` through registered dependencies, looking for `target`.
fn reaches(tasks: &HashMap<String, Arc<TaskSlot>>, start: &BTreeSet<String>, target: &str) -> bool {
    let mut stack: Vec<&str> = start.iter().map(String::as_str).collect();
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(slot) = tasks.get(id) {
            stack.extend(slot.dependencies.iter().map(String::as_str));
        }
    }
    false
}
