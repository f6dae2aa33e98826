use async_trait::async_trait;
use coterie_core::{CoterieResult, TaskPayload};
use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of an agent, as reported by the agent itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    /// The agent's registered name.
    pub name: String,
    /// Whether the agent is currently processing work.
    pub busy: bool,
    /// Free-form detail (model name, queue depth, last error).
    #[serde(default)]
    pub detail: Option<String>,
}

/// The capability interface every concrete agent implements.
///
/// The core consumes this polymorphically: given a payload, return a result
/// or fail with an error detail. What the agent actually computes — which
/// model it calls, what prompt it builds — is not the core's concern.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The agent's unique name.
    fn name(&self) -> &str;

    /// The capability tags this agent can perform.
    fn capabilities(&self) -> Vec<String>;

    /// Process a task payload, returning its result.
    async fn process(&self, payload: TaskPayload) -> CoterieResult<serde_json::Value>;

    /// Status query. The default reports an idle agent.
    async fn status(&self) -> AgentStatus {
        AgentStatus {
            name: self.name().to_string(),
            busy: false,
            detail: None,
        }
    }
}
