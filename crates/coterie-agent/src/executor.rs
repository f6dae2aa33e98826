use async_trait::async_trait;
use coterie_core::{CoterieResult, TaskPayload};

/// Name-addressed task dispatch.
///
/// The workflow engine dispatches each ready task to the agent named in the
/// task definition through this seam. In production the implementation is
/// the task coordinator (breaker, timeout, and load accounting included);
/// tests substitute mocks.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute a payload on the named agent, returning the agent's result.
    async fn execute(
        &self,
        agent_name: &str,
        payload: TaskPayload,
    ) -> CoterieResult<serde_json::Value>;
}
