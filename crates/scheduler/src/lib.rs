pub mod heartbeat;
pub mod locks;
pub mod scheduler;
pub mod task;

pub use heartbeat::HeartbeatMonitor;
pub use locks::ResourceLocks;
pub use scheduler::{Escalation, StallEvent, TaskScheduler, TaskSummary};
pub use task::{Checkpoint, StallCause, Task, TaskMetrics, TaskPriority, TaskStatus};
