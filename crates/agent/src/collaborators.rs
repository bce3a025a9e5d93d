//! Narrow contracts for the reasoning and collaboration engines. The runtime
//! only consumes their results; how they are computed lives elsewhere.

use async_trait::async_trait;
use conclave_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningResult {
    pub conclusion: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn perform_reasoning(
        &self,
        query: &str,
        reasoning_type: &str,
        context: &Value,
    ) -> Result<ReasoningResult>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaboration {
    pub plan_id: String,
    pub participants: Vec<String>,
    /// agent id -> role
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
    #[serde(default)]
    pub status: String,
}

#[async_trait]
pub trait CollaborationEngine: Send + Sync {
    async fn initiate_collaboration(&self, plan_id: &str, agents: &[String]) -> Result<Collaboration>;

    async fn assign_roles(&self, plan_id: &str, roles: &BTreeMap<String, String>) -> Result<()>;

    async fn update_progress(&self, plan_id: &str, agent_id: &str, progress: f64) -> Result<()>;

    /// Returns the engine's resolution.
    async fn resolve_conflict(&self, plan_id: &str, conflict: &Value) -> Result<Value>;
}
