use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// A task this agent accepted and has not yet completed.
pub struct InFlightTask {
    pub task_id: String,
    pub data: Value,
    pub attempt: u32,
    /// Processor run, if one is live.
    handle: Option<JoinHandle<()>>,
}

impl InFlightTask {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Agent-local ledger of accepted tasks and their processor runs.
#[derive(Clone, Default)]
pub struct TaskManager {
    tasks: Arc<Mutex<HashMap<String, InFlightTask>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task_id: &str, data: Value) {
        let entry = InFlightTask {
            task_id: task_id.to_string(),
            data,
            attempt: 1,
            handle: None,
        };
        self.tasks.lock().await.insert(task_id.to_string(), entry);
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.tasks.lock().await.contains_key(task_id)
    }

    /// Attach a processor run. A task completed in the meantime is left alone
    /// and the finished handle is dropped.
    pub async fn set_handle(&self, task_id: &str, handle: JoinHandle<()>) {
        if let Some(task) = self.tasks.lock().await.get_mut(task_id) {
            task.handle = Some(handle);
        }
    }

    /// Abort the current run (if any) and bump the attempt counter.
    /// Returns the task data and the new attempt number.
    pub async fn begin_retry(&self, task_id: &str) -> Option<(Value, u32)> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(task_id)?;
        if let Some(handle) = task.handle.take() {
            handle.abort();
        }
        task.attempt += 1;
        Some((task.data.clone(), task.attempt))
    }

    /// Abort the current run, keeping the entry.
    pub async fn abort(&self, task_id: &str) {
        if let Some(task) = self.tasks.lock().await.get_mut(task_id) {
            if let Some(handle) = task.handle.take() {
                handle.abort();
            }
        }
    }

    /// Tasks with no live processor run: `(task_id, data, attempt)`.
    pub async fn idle(&self) -> Vec<(String, Value, u32)> {
        let tasks = self.tasks.lock().await;
        let mut out: Vec<(String, Value, u32)> = tasks
            .values()
            .filter(|t| !t.is_running())
            .map(|t| (t.task_id.clone(), t.data.clone(), t.attempt))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Forget a task. The processor run is not aborted, since it may be the caller.
    pub async fn remove(&self, task_id: &str) -> bool {
        self.tasks.lock().await.remove(task_id).is_some()
    }

    /// Abort every run and clear the ledger. Returns the task ids.
    pub async fn drain(&self) -> Vec<String> {
        let mut tasks = self.tasks.lock().await;
        let mut ids = Vec::with_capacity(tasks.len());
        for (id, task) in tasks.drain() {
            if let Some(handle) = task.handle {
                handle.abort();
            }
            ids.push(id);
        }
        ids.sort();
        ids
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
