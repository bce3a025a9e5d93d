use chrono::{DateTime, Utc};
use conclave_core::{AgentDefaults, Error, Message, MessageCategory, Result};
use conclave_scheduler::{Escalation, Task, TaskPriority, TaskScheduler, TaskStatus};
use conclave_storage::{
    AccessLevel, MemoryEntry, MemoryQuery, MemoryStats, MemoryStore, MemoryType, MemoryUpdate,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{handler_fn, CommunicationMetrics, MessageBus};
use crate::collaborators::{Collaboration, CollaborationEngine, ReasoningEngine};
use crate::processor::{TaskContext, TaskProcessor};
use crate::task_manager::TaskManager;

/// Lifecycle of an agent. Transitions only go forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initialized,
    Active,
    Stopped,
}

/// The shared services an agent works against.
#[derive(Clone)]
pub struct AgentServices {
    pub bus: Arc<MessageBus>,
    pub scheduler: Arc<TaskScheduler>,
    pub memory: Arc<MemoryStore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub error_count: u64,
    pub success_count: u64,
    pub total_tasks: u64,
    pub last_active: DateTime<Utc>,
    pub in_flight: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub total_tasks: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub in_flight: usize,
    pub communication: Option<CommunicationMetrics>,
    pub memory: Option<MemoryStats>,
}

/// Requirements read from task data. Unknown keys are left to the processor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TaskRequirements {
    required_capabilities: BTreeSet<String>,
    resources: BTreeSet<String>,
    dependencies: BTreeSet<String>,
    priority: Option<TaskPriority>,
    timeout_secs: Option<u64>,
}

impl TaskRequirements {
    fn from_data(data: &Value) -> Result<Self> {
        if !data.is_object() {
            return Ok(Self::default());
        }
        serde_json::from_value(data.clone())
            .map_err(|e| Error::Validation(format!("malformed task data: {}", e)))
    }
}

struct AgentState {
    status: AgentStatus,
    current_task: Option<String>,
    error_count: u64,
    success_count: u64,
    total_tasks: u64,
    last_active: DateTime<Utc>,
}

/// A long-lived worker wired to the bus, the scheduler and the memory store.
///
/// Task execution is delegated to the injected [`TaskProcessor`]. Two loops
/// run while the agent is active: one drains its mailbox, the other refreshes
/// its heartbeat and applies the stall escalation policy to its own tasks.
pub struct Agent {
    id: String,
    name: String,
    capabilities: BTreeSet<String>,
    config: AgentDefaults,
    bus: Arc<MessageBus>,
    scheduler: Arc<TaskScheduler>,
    memory: Arc<MemoryStore>,
    processor: Arc<dyn TaskProcessor>,
    reasoning: Option<Arc<dyn ReasoningEngine>>,
    collaboration: Option<Arc<dyn CollaborationEngine>>,
    state: Mutex<AgentState>,
    tasks: TaskManager,
    shutdown: broadcast::Sender<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(
        id: &str,
        name: &str,
        services: &AgentServices,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            capabilities: BTreeSet::new(),
            config: AgentDefaults::default(),
            bus: services.bus.clone(),
            scheduler: services.scheduler.clone(),
            memory: services.memory.clone(),
            processor,
            reasoning: None,
            collaboration: None,
            state: Mutex::new(AgentState {
                status: AgentStatus::Initialized,
                current_task: None,
                error_count: 0,
                success_count: 0,
                total_tasks: 0,
                last_active: Utc::now(),
            }),
            tasks: TaskManager::new(),
            shutdown,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_config(mut self, config: AgentDefaults) -> Self {
        self.config = config;
        self
    }

    pub fn with_reasoning(mut self, engine: Arc<dyn ReasoningEngine>) -> Self {
        self.reasoning = Some(engine);
        self
    }

    pub fn with_collaboration(mut self, engine: Arc<dyn CollaborationEngine>) -> Self {
        self.collaboration = Some(engine);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> AgentStatus {
        self.state().status
    }

    // --- lifecycle -------------------------------------------------------

    /// Register on the bus and start the dispatch and supervision loops.
    /// `false` if the agent was already started (or stopped).
    pub async fn start(self: &Arc<Self>) -> Result<bool> {
        {
            let mut state = self.state();
            if state.status != AgentStatus::Initialized {
                debug!(agent_id = %self.id, status = ?state.status, "Start ignored");
                return Ok(false);
            }
            state.status = AgentStatus::Active;
            state.last_active = Utc::now();
        }

        if let Err(e) = self.attach().await {
            self.state().status = AgentStatus::Initialized;
            let _ = self.bus.deregister_agent(&self.id).await;
            return Err(e);
        }
        self.scheduler.record_heartbeat(&self.id).await;

        let dispatch = tokio::spawn(self.clone().run_dispatch_loop(self.shutdown.subscribe()));
        let supervision = tokio::spawn(self.clone().run_supervision_loop(self.shutdown.subscribe()));
        self.loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend([dispatch, supervision]);

        info!(agent_id = %self.id, name = %self.name, capabilities = ?self.capabilities, "Agent started");
        Ok(true)
    }

    async fn attach(self: &Arc<Self>) -> Result<()> {
        self.bus.register_agent(&self.id).await?;

        let weak = Arc::downgrade(self);
        self.bus
            .register_handler(
                &self.id,
                MessageCategory::Query,
                handler_fn(move |message: Message| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(agent) => agent.handle_query(message).await,
                            None => Ok(None),
                        }
                    }
                }),
            )
            .await?;

        let scheduler = self.scheduler.clone();
        let agent_id = self.id.clone();
        self.bus
            .register_handler(
                &self.id,
                MessageCategory::Heartbeat,
                handler_fn(move |_message: Message| {
                    let scheduler = scheduler.clone();
                    let agent_id = agent_id.clone();
                    async move {
                        scheduler.record_heartbeat(&agent_id).await;
                        Ok(None)
                    }
                }),
            )
            .await?;
        Ok(())
    }

    /// Stop the loops, interrupt in-flight tasks (releasing their resources)
    /// and leave the bus. `false` unless the agent was active.
    pub async fn stop(&self) -> bool {
        {
            let mut state = self.state();
            if state.status != AgentStatus::Active {
                debug!(agent_id = %self.id, status = ?state.status, "Stop ignored");
                return false;
            }
            state.status = AgentStatus::Stopped;
            state.current_task = None;
        }

        let _ = self.shutdown.send(());
        let interrupted = self.release_in_flight().await;
        let discarded = match self.bus.deregister_agent(&self.id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(agent_id = %self.id, error = %e, "Bus deregistration failed");
                0
            }
        };
        self.scheduler.forget_agent(&self.id).await;
        info!(agent_id = %self.id, interrupted, discarded, "Agent stopped");

        // Last, since stop may be running on one of these loops
        let loops: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in loops {
            handle.abort();
        }
        true
    }

    async fn release_in_flight(&self) -> usize {
        let ids = self.tasks.drain().await;
        for task_id in &ids {
            if let Err(e) = self.scheduler.interrupt_task(task_id).await {
                debug!(task_id = %task_id, error = %e, "Interrupt skipped");
            }
            self.scheduler.release_resources(task_id);
        }
        ids.len()
    }

    // --- tasks -----------------------------------------------------------

    /// Accept a task. Returns `false` if the agent is not active, lacks a
    /// required capability, or the scheduler refuses the task; the reason is
    /// broadcast as a `task_rejected` notification.
    pub async fn assign_task(self: &Arc<Self>, task_id: &str, data: Value) -> bool {
        match self.try_assign(task_id, data).await {
            Ok(()) => true,
            Err(e) => {
                self.report_rejection(task_id, &e.to_string()).await;
                false
            }
        }
    }

    async fn try_assign(self: &Arc<Self>, task_id: &str, data: Value) -> Result<()> {
        if self.status() != AgentStatus::Active {
            return Err(Error::Validation(format!("agent '{}' is not active", self.id)));
        }

        let req = TaskRequirements::from_data(&data)?;
        let missing: Vec<&String> = req.required_capabilities.difference(&self.capabilities).collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!("missing capabilities: {:?}", missing)));
        }

        let timeout = req
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.scheduler.config().default_task_timeout());
        let mut task = Task::new(task_id, &self.id, timeout)
            .with_dependencies(req.dependencies)
            .with_resources(req.resources);
        if let Some(priority) = req.priority {
            task = task.with_priority(priority);
        }
        self.scheduler.register_task(task).await?;
        self.tasks.insert(task_id, data.clone()).await;

        {
            let mut state = self.state();
            state.current_task = Some(task_id.to_string());
            state.total_tasks += 1;
            state.last_active = Utc::now();
        }
        info!(agent_id = %self.id, task_id = %task_id, "Task accepted");

        self.try_launch(task_id, data, 1).await;
        Ok(())
    }

    async fn report_rejection(&self, task_id: &str, reason: &str) {
        warn!(agent_id = %self.id, task_id = %task_id, reason = %reason, "Task rejected");
        self.bus
            .broadcast_notification(
                &self.id,
                json!({
                    "type": "task_rejected",
                    "agent_id": self.id,
                    "task_id": task_id,
                    "reason": reason,
                }),
            )
            .await;
    }

    /// Start the task if its dependencies are done and its resources are free.
    async fn try_launch(self: &Arc<Self>, task_id: &str, data: Value, attempt: u32) -> bool {
        match self.scheduler.start_task(task_id).await {
            Ok(true) => {
                let agent = self.clone();
                let id = task_id.to_string();
                let handle = tokio::spawn(async move { agent.run_processor(id, data, attempt).await });
                self.tasks.set_handle(task_id, handle).await;
                true
            }
            Ok(false) => {
                debug!(task_id = %task_id, "Task waiting for dependencies or resources");
                false
            }
            Err(e) if e.is_conflict() => {
                debug!(task_id = %task_id, error = %e, "Task start deferred");
                false
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Task could not be started");
                false
            }
        }
    }

    async fn run_processor(self: Arc<Self>, task_id: String, mut data: Value, attempt: u32) {
        if let Value::Object(map) = &mut data {
            map.insert("attempt".to_string(), json!(attempt));
        }
        let ctx = TaskContext::new(
            &task_id,
            &self.id,
            attempt,
            self.scheduler.clone(),
            self.memory.clone(),
        );

        let (success, result) = match self.processor.process(ctx, data).await {
            Ok(result) => (true, result),
            Err(e) => {
                let status = self.scheduler.get_task(&task_id).await.map(|t| t.status);
                if matches!(status, Some(TaskStatus::Stalled) | Some(TaskStatus::Pending)) {
                    debug!(task_id = %task_id, error = %e, "Processor stopped on stalled task");
                    return;
                }
                (false, json!({ "error": e.to_string() }))
            }
        };
        if let Err(e) = self.complete_task(&task_id, success, result).await {
            warn!(task_id = %task_id, error = %e, "Task completion failed");
        }
    }

    /// Record the outcome: memory, counters, scheduler cleanup and a
    /// `task_completed` broadcast.
    pub async fn complete_task(&self, task_id: &str, success: bool, result: Value) -> Result<()> {
        let tracked = self.tasks.remove(task_id).await;
        let task = self.scheduler.get_task(task_id).await;
        if !tracked && task.is_none() {
            return Err(Error::NotFound(format!("task '{}'", task_id)));
        }

        if let Some(task) = &task {
            if !task.status.is_terminal() {
                if let Err(e) = self.scheduler.finish_task(task_id, success).await {
                    warn!(task_id = %task_id, error = %e, "Scheduler finish failed");
                }
            }
        }
        self.scheduler.remove_task(task_id).await;

        self.remember_outcome(task_id, success, &result).await;

        {
            let mut state = self.state();
            state.current_task = None;
            if success {
                state.success_count += 1;
            } else {
                state.error_count += 1;
            }
            state.last_active = Utc::now();
        }

        if success {
            info!(agent_id = %self.id, task_id = %task_id, "Task completed");
        } else {
            warn!(agent_id = %self.id, task_id = %task_id, result = %result, "Task failed");
        }

        self.bus
            .broadcast_notification(
                &self.id,
                json!({
                    "type": "task_completed",
                    "agent_id": self.id,
                    "task_id": task_id,
                    "success": success,
                    "result": result,
                }),
            )
            .await;
        Ok(())
    }

    async fn remember_outcome(&self, task_id: &str, success: bool, result: &Value) {
        let outcome = if success { "success" } else { "failure" };
        let episode = MemoryEntry::new(
            MemoryType::Episodic,
            &self.id,
            json!({
                "task_id": task_id,
                "success": success,
                "result": result,
            }),
            if success { 0.6 } else { 0.8 },
        )
        .with_tags(["interaction", "task", outcome])
        .with_context("task_id", json!(task_id));
        let episode_id = episode.id.clone();

        if let Err(e) = self.memory.store(episode).await {
            warn!(task_id = %task_id, error = %e, "Failed to record task episode");
        }

        let recurring = result.get("recurring").and_then(Value::as_bool).unwrap_or(false);
        if success && recurring {
            let procedure = MemoryEntry::new(
                MemoryType::Procedural,
                &self.id,
                json!({ "task_id": task_id, "procedure": result }),
                0.8,
            )
            .with_tags(["procedure", "task"])
            .with_context("task_id", json!(task_id))
            .with_related(&episode_id);
            if let Err(e) = self.memory.store(procedure).await {
                warn!(task_id = %task_id, error = %e, "Failed to record task procedure");
            }
        }
    }

    // --- loops -----------------------------------------------------------

    async fn run_dispatch_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        debug!(agent_id = %self.id, "Dispatch loop started");
        let mut interval = tokio::time::interval(self.config.dispatch_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                registered = self.bus.wait_for_mail(&self.id) => {
                    if !registered {
                        break;
                    }
                }
                _ = interval.tick() => {}
            }
            if let Err(e) = self.bus.process_messages(&self.id).await {
                debug!(agent_id = %self.id, error = %e, "Dispatch loop leaving");
                break;
            }
        }
        debug!(agent_id = %self.id, "Dispatch loop stopped");
    }

    async fn run_supervision_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.heartbeat_interval();
        info!(agent_id = %self.id, interval_secs = period.as_secs(), "Agent supervision started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.supervise().await;
                }
                _ = shutdown.recv() => {
                    let released = self.release_in_flight().await;
                    info!(agent_id = %self.id, released, "Agent supervision shutting down");
                    break;
                }
            }
        }
    }

    /// One supervision tick: heartbeat, stall escalation for this agent's
    /// tasks, then another start attempt for queued ones.
    pub async fn supervise(self: &Arc<Self>) {
        self.scheduler.record_heartbeat(&self.id).await;
        self.scheduler.check_stalls().await;

        for task in self
            .scheduler
            .tasks_for_agent(&self.id, Some(TaskStatus::Stalled))
            .await
        {
            if !self.tasks.contains(&task.task_id).await {
                continue;
            }
            match self.scheduler.escalate(&task.task_id).await {
                Ok(Escalation::Retry { retry_count }) => {
                    if let Some((data, attempt)) = self.tasks.begin_retry(&task.task_id).await {
                        info!(task_id = %task.task_id, retry_count, attempt, "Retrying stalled task");
                        self.try_launch(&task.task_id, data, attempt).await;
                    }
                }
                Ok(Escalation::Fail { status }) => {
                    self.tasks.abort(&task.task_id).await;
                    let result = json!({
                        "error": "stall budget exhausted",
                        "status": status,
                        "stall_count": task.metrics.stall_count,
                    });
                    if let Err(e) = self.complete_task(&task.task_id, false, result).await {
                        warn!(task_id = %task.task_id, error = %e, "Cleanup after escalation failed");
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Escalation failed");
                }
            }
        }

        for (task_id, data, attempt) in self.tasks.idle().await {
            let pending = self
                .scheduler
                .get_task(&task_id)
                .await
                .is_some_and(|t| t.status == TaskStatus::Pending);
            if pending {
                self.try_launch(&task_id, data, attempt).await;
            }
        }
    }

    // --- requests over the bus -------------------------------------------

    async fn handle_query(self: &Arc<Self>, message: Message) -> Result<Option<Value>> {
        if message.content.get("type").and_then(Value::as_str) != Some("task_request") {
            return Ok(None);
        }
        let task_id = message
            .content
            .get("task_id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let data = message.content.get("data").cloned().unwrap_or(Value::Null);
        debug!(agent_id = %self.id, task_id = %task_id, from = %message.sender_id, "Task request received");

        let outcome = match self.consult_reasoning(&task_id, &data).await {
            Ok(()) => self.try_assign(&task_id, data).await.map_err(|e| e.to_string()),
            Err(reason) => Err(reason),
        };

        let reply = match outcome {
            Ok(()) => json!({ "accepted": true, "task_id": task_id }),
            Err(reason) => {
                self.report_rejection(&task_id, &reason).await;
                json!({ "accepted": false, "task_id": task_id, "reason": reason })
            }
        };
        Ok(Some(reply))
    }

    /// Ask the reasoning engine whether to take the task. Engine failures
    /// accept unless reasoning is required.
    async fn consult_reasoning(&self, task_id: &str, data: &Value) -> std::result::Result<(), String> {
        let Some(engine) = &self.reasoning else {
            if self.config.require_reasoning {
                return Err("reasoning engine unavailable".to_string());
            }
            return Ok(());
        };

        let query = format!("Should agent '{}' accept task '{}'?", self.id, task_id);
        match engine.perform_reasoning(&query, "task_acceptance", data).await {
            Ok(r) if r.confidence >= self.config.min_reasoning_confidence => {
                debug!(task_id = %task_id, confidence = r.confidence, conclusion = %r.conclusion, "Reasoning accepted task");
                Ok(())
            }
            Ok(r) => Err(format!(
                "declined by reasoning (confidence {:.2}): {}",
                r.confidence, r.rationale
            )),
            Err(e) if self.config.require_reasoning => Err(format!("reasoning failed: {}", e)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Reasoning failed, accepting task");
                Ok(())
            }
        }
    }

    // --- collaboration ---------------------------------------------------

    fn collaboration_engine(&self) -> Option<&Arc<dyn CollaborationEngine>> {
        if self.collaboration.is_none() {
            warn!(agent_id = %self.id, "{}", Error::Collaboration("no engine configured".into()));
        }
        self.collaboration.as_ref()
    }

    /// Start a collaboration and invite the other participants. `None` when
    /// the engine is missing or fails.
    pub async fn collaborate(&self, plan_id: &str, agents: &[String]) -> Option<Collaboration> {
        let engine = self.collaboration_engine()?;
        match engine.initiate_collaboration(plan_id, agents).await {
            Ok(collab) => {
                for participant in collab.participants.iter().filter(|p| **p != self.id) {
                    let invite = Message::notification(
                        &self.id,
                        participant,
                        json!({ "type": "collaboration_invite", "plan_id": plan_id }),
                    )
                    .with_context("plan_id", json!(plan_id));
                    self.bus.send(invite).await;
                }
                info!(agent_id = %self.id, plan_id = %plan_id, participants = collab.participants.len(), "Collaboration started");
                Some(collab)
            }
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Collaboration unavailable");
                None
            }
        }
    }

    pub async fn assign_collaboration_roles(&self, plan_id: &str, roles: &BTreeMap<String, String>) -> bool {
        let Some(engine) = self.collaboration_engine() else {
            return false;
        };
        match engine.assign_roles(plan_id, roles).await {
            Ok(()) => true,
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Role assignment failed");
                false
            }
        }
    }

    pub async fn report_collaboration_progress(&self, plan_id: &str, progress: f64) -> bool {
        let Some(engine) = self.collaboration_engine() else {
            return false;
        };
        match engine.update_progress(plan_id, &self.id, progress).await {
            Ok(()) => true,
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Collaboration progress not recorded");
                false
            }
        }
    }

    pub async fn resolve_collaboration_conflict(&self, plan_id: &str, conflict: &Value) -> Option<Value> {
        let engine = self.collaboration_engine()?;
        match engine.resolve_conflict(plan_id, conflict).await {
            Ok(resolution) => Some(resolution),
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Conflict resolution failed");
                None
            }
        }
    }

    // --- memory ----------------------------------------------------------

    /// Store an entry owned by this agent.
    pub async fn store_memory(&self, mut entry: MemoryEntry) -> Result<bool> {
        entry.owner_id = self.id.clone();
        self.memory.store(entry).await
    }

    /// Retrieve with this agent as the requester.
    pub async fn retrieve_memories(&self, mut query: MemoryQuery) -> Result<Vec<MemoryEntry>> {
        query.owner_id = Some(self.id.clone());
        self.memory.retrieve(&query).await
    }

    /// Update an entry this agent can see. Private entries of other agents are refused.
    pub async fn update_memory(&self, id: &str, update: &MemoryUpdate) -> Result<bool> {
        match self.memory.get(id).await? {
            None => Ok(false),
            Some(entry) if entry.access_level == AccessLevel::Private && entry.owner_id != self.id => Err(
                Error::Validation(format!("memory '{}' is private to '{}'", id, entry.owner_id)),
            ),
            Some(_) => self.memory.update(id, update).await,
        }
    }

    // --- introspection ---------------------------------------------------

    pub async fn get_state(&self) -> AgentSnapshot {
        let in_flight = self.tasks.ids().await;
        let state = self.state();
        AgentSnapshot {
            agent_id: self.id.clone(),
            name: self.name.clone(),
            capabilities: self.capabilities.iter().cloned().collect(),
            status: state.status,
            current_task: state.current_task.clone(),
            error_count: state.error_count,
            success_count: state.success_count,
            total_tasks: state.total_tasks,
            last_active: state.last_active,
            in_flight,
        }
    }

    pub async fn get_metrics(&self) -> AgentMetrics {
        let in_flight = self.tasks.len().await;
        let communication = self.bus.get_communication_metrics(&self.id).await;
        let memory = match self.memory.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Memory stats unavailable");
                None
            }
        };

        let state = self.state();
        let finished = state.success_count + state.error_count;
        AgentMetrics {
            agent_id: self.id.clone(),
            total_tasks: state.total_tasks,
            success_count: state.success_count,
            error_count: state.error_count,
            success_rate: if finished == 0 {
                0.0
            } else {
                state.success_count as f64 / finished as f64
            },
            in_flight,
            communication,
            memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conclave_core::{BusConfig, MemoryConfig, SchedulerConfig};
    use conclave_storage::InMemoryStorage;

    struct Echo;

    #[async_trait]
    impl TaskProcessor for Echo {
        async fn process(&self, ctx: TaskContext, data: Value) -> Result<Value> {
            ctx.report_progress(0.5).await?;
            Ok(data)
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskProcessor for Failing {
        async fn process(&self, _ctx: TaskContext, _data: Value) -> Result<Value> {
            Err(Error::Other("disk on fire".into()))
        }
    }

    /// Never finishes on its own.
    struct Hang;

    #[async_trait]
    impl TaskProcessor for Hang {
        async fn process(&self, _ctx: TaskContext, _data: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn services(scheduler: SchedulerConfig) -> AgentServices {
        AgentServices {
            bus: Arc::new(MessageBus::new(BusConfig::default())),
            scheduler: Arc::new(TaskScheduler::new(scheduler)),
            memory: Arc::new(MemoryStore::new(
                MemoryConfig::default(),
                Arc::new(InMemoryStorage::new()),
            )),
        }
    }

    fn agent(services: &AgentServices, processor: Arc<dyn TaskProcessor>) -> Arc<Agent> {
        Arc::new(Agent::new("worker", "Worker", services, processor).with_capabilities(["analysis"]))
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Echo));

        assert!(a.start().await.unwrap());
        assert!(!a.start().await.unwrap());
        assert_eq!(a.status(), AgentStatus::Active);
        assert!(svc.bus.is_registered("worker").await);

        assert!(a.stop().await);
        assert!(!a.stop().await);
        assert!(!a.start().await.unwrap());
        assert_eq!(a.status(), AgentStatus::Stopped);
        assert!(!svc.bus.is_registered("worker").await);
    }

    #[tokio::test]
    async fn test_assign_requires_active_and_capabilities() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Hang));
        assert!(!a.assign_task("T0", json!({})).await);

        a.start().await.unwrap();
        assert!(!a.assign_task("T1", json!({"required_capabilities": ["gpu"]})).await);
        assert!(svc.scheduler.get_task("T1").await.is_none());

        assert!(a.assign_task("T2", json!({"required_capabilities": ["analysis"]})).await);
        let state = a.get_state().await;
        assert_eq!(state.current_task.as_deref(), Some("T2"));
        assert_eq!(state.total_tasks, 1);
        a.stop().await;
    }

    #[tokio::test]
    async fn test_success_records_memories() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Echo));
        a.start().await.unwrap();

        assert!(a.assign_task("T1", json!({"recurring": true, "resources": ["gpu0"]})).await);
        let watched = a.clone();
        wait_until(|| {
            let watched = watched.clone();
            async move { watched.get_state().await.success_count == 1 }
        })
        .await;

        let episodes = a
            .retrieve_memories(MemoryQuery::default().of_type(MemoryType::Episodic).with_tags(["success"]))
            .await
            .unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].content["task_id"], json!("T1"));

        let procedures = a
            .retrieve_memories(MemoryQuery::default().of_type(MemoryType::Procedural))
            .await
            .unwrap();
        assert_eq!(procedures.len(), 1);
        assert!(procedures[0].related_memories.contains(&episodes[0].id));

        assert!(svc.scheduler.resource_holder("gpu0").is_none());
        assert!(svc.scheduler.get_task("T1").await.is_none());
        assert!(a.get_state().await.current_task.is_none());
        a.stop().await;
    }

    #[tokio::test]
    async fn test_failure_is_counted_and_remembered() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Failing));
        a.start().await.unwrap();

        assert!(a.assign_task("T1", json!({})).await);
        let watched = a.clone();
        wait_until(|| {
            let watched = watched.clone();
            async move { watched.get_state().await.error_count == 1 }
        })
        .await;

        let failures = a
            .retrieve_memories(MemoryQuery::default().with_tags(["failure"]))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].content["result"]["error"]
            .as_str()
            .unwrap()
            .contains("disk on fire"));
        assert_eq!(a.get_metrics().await.success_rate, 0.0);
        a.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_in_flight_resources() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Hang));
        a.start().await.unwrap();

        assert!(a.assign_task("T1", json!({"resources": ["gpu0", "disk"]})).await);
        assert_eq!(svc.scheduler.resource_holder("gpu0").as_deref(), Some("T1"));

        assert!(a.stop().await);
        assert!(svc.scheduler.resource_holder("gpu0").is_none());
        assert!(svc.scheduler.resource_holder("disk").is_none());
        assert_eq!(
            svc.scheduler.get_task("T1").await.unwrap().status,
            TaskStatus::Interrupted
        );
    }

    #[tokio::test]
    async fn test_stalled_task_is_retried_then_failed() {
        let svc = services(SchedulerConfig {
            stall_threshold_secs: 0,
            ..Default::default()
        });
        let a = agent(&svc, Arc::new(Hang));
        a.start().await.unwrap();
        assert!(a.assign_task("T1", json!({"resources": ["gpu0"]})).await);

        for round in 1..=3u32 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            a.supervise().await;
            let task = svc.scheduler.get_task("T1").await.unwrap();
            assert_eq!(task.metrics.retry_count, round);
            assert_eq!(task.status, TaskStatus::Running);
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        a.supervise().await;
        assert!(svc.scheduler.get_task("T1").await.is_none());
        assert!(svc.scheduler.resource_holder("gpu0").is_none());
        let state = a.get_state().await;
        assert_eq!(state.error_count, 1);
        assert!(state.in_flight.is_empty());
        a.stop().await;
    }

    #[tokio::test]
    async fn test_queued_task_starts_after_dependency() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Echo));
        a.start().await.unwrap();

        svc.scheduler
            .register_task(Task::new("prep", "elsewhere", Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(a.assign_task("main", json!({"dependencies": ["prep"]})).await);
        assert_eq!(
            svc.scheduler.get_task("main").await.unwrap().status,
            TaskStatus::Pending
        );

        svc.scheduler.start_task("prep").await.unwrap();
        svc.scheduler.finish_task("prep", true).await.unwrap();
        a.supervise().await;

        let watched = a.clone();
        wait_until(|| {
            let watched = watched.clone();
            async move { watched.get_state().await.success_count == 1 }
        })
        .await;
        a.stop().await;
    }

    #[tokio::test]
    async fn test_completion_clears_current_task() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Hang));
        a.start().await.unwrap();
        assert!(a.assign_task("T1", json!({})).await);
        assert!(a.assign_task("T2", json!({})).await);
        assert_eq!(a.get_state().await.current_task.as_deref(), Some("T2"));

        a.complete_task("T2", true, json!({"done": true})).await.unwrap();
        let state = a.get_state().await;
        assert!(state.current_task.is_none());
        assert_eq!(state.in_flight, vec!["T1".to_string()]);
        assert_eq!(state.success_count, 1);
        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervision_loop_launches_queued_task() {
        let svc = services(SchedulerConfig::default());
        let defaults = AgentDefaults {
            heartbeat_interval_secs: 1,
            ..Default::default()
        };
        let a = Arc::new(
            Agent::new("worker", "Worker", &svc, Arc::new(Echo))
                .with_capabilities(["analysis"])
                .with_config(defaults),
        );
        a.start().await.unwrap();

        svc.scheduler
            .register_task(Task::new("prep", "elsewhere", Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(a.assign_task("main", json!({"dependencies": ["prep"]})).await);
        svc.scheduler.start_task("prep").await.unwrap();
        svc.scheduler.finish_task("prep", true).await.unwrap();
        assert_eq!(
            svc.scheduler.get_task("main").await.unwrap().status,
            TaskStatus::Pending
        );

        let watched = a.clone();
        wait_until(|| {
            let watched = watched.clone();
            async move { watched.get_state().await.success_count == 1 }
        })
        .await;
        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_release_in_flight_on_shutdown() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Hang));
        a.start().await.unwrap();
        assert!(a.assign_task("T1", json!({"resources": ["gpu0"]})).await);

        a.shutdown.send(()).unwrap();
        let loops: Vec<JoinHandle<()>> = a.loops.lock().unwrap().drain(..).collect();
        assert_eq!(loops.len(), 2);
        for handle in loops {
            handle.await.unwrap();
        }

        assert!(svc.scheduler.resource_holder("gpu0").is_none());
        assert!(a.get_state().await.in_flight.is_empty());
        assert_eq!(
            svc.scheduler.get_task("T1").await.unwrap().status,
            TaskStatus::Interrupted
        );
    }

    #[tokio::test]
    async fn test_collaboration_without_engine_degrades() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Echo));
        assert!(a.collaborate("plan-1", &["x".to_string()]).await.is_none());
        assert!(!a.report_collaboration_progress("plan-1", 0.5).await);
        assert!(a.resolve_collaboration_conflict("plan-1", &json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_private_memory_update_is_refused() {
        let svc = services(SchedulerConfig::default());
        let a = agent(&svc, Arc::new(Echo));
        let entry = MemoryEntry::new(MemoryType::Working, "someone-else", json!("x"), 0.3);
        let id = entry.id.clone();
        svc.memory.store(entry).await.unwrap();

        let update = MemoryUpdate {
            importance: Some(0.9),
            ..Default::default()
        };
        assert!(a.update_memory(&id, &update).await.is_err());
        assert!(!a.update_memory("missing", &update).await.unwrap());
    }
}
