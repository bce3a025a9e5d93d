use async_trait::async_trait;
use conclave_core::{Error, Result};
use conclave_scheduler::TaskScheduler;
use conclave_storage::MemoryStore;
use serde_json::Value;
use std::sync::Arc;

/// Executes the work behind a task. Implemented per agent specialisation and
/// injected into the generic [`Agent`](crate::Agent).
///
/// The returned value becomes the task result; `{"recurring": true}` in it
/// asks the agent to also remember the task as a procedure.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, ctx: TaskContext, data: Value) -> Result<Value>;
}

/// Handle given to a processor for one attempt of one task.
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    agent_id: String,
    attempt: u32,
    scheduler: Arc<TaskScheduler>,
    memory: Arc<MemoryStore>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: &str,
        agent_id: &str,
        attempt: u32,
        scheduler: Arc<TaskScheduler>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            attempt,
            scheduler,
            memory,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// 1 for the first run, incremented on every retry after a stall.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Report progress in `[0, 1]`. Fails with `Error::Stalled` when the report
    /// itself tripped the stall predicate; the processor should return then.
    pub async fn report_progress(&self, progress: f64) -> Result<()> {
        match self.scheduler.update_progress(&self.task_id, progress).await? {
            Some(event) => Err(Error::Stalled {
                task_id: event.task_id,
                stall_count: event.stall_count,
            }),
            None => Ok(()),
        }
    }
}
