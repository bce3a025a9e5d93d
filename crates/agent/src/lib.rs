pub mod bus;
pub mod collaborators;
pub mod context;
pub mod health;
pub mod memory_adapter;
pub mod processor;
pub mod runtime;
pub mod task_manager;

pub use bus::{
    handler_fn, ChannelStatus, CommunicationMetrics, MessageBus, MessageHandler, Subscriber,
    SubscriptionId,
};
pub use collaborators::{Collaboration, CollaborationEngine, ReasoningEngine, ReasoningResult};
pub use context::{AgentContext, ConversationLog};
pub use health::{BusAlert, BusMonitor};
pub use memory_adapter::BusShareHook;
pub use processor::{TaskContext, TaskProcessor};
pub use runtime::{Agent, AgentMetrics, AgentServices, AgentSnapshot, AgentStatus};
pub use task_manager::{InFlightTask, TaskManager};
