use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::AgentDescriptor;

/// Agent lookup used by task steps to resolve dispatch targets.
pub trait AgentDirectory: Send + Sync + 'static {
    /// Look up an agent by id. `None` means the agent is unknown.
    fn get_agent(&self, agent_id: &str) -> BoxFuture<'_, Option<AgentDescriptor>>;
}

/// Agent runtime that performs task work.
pub trait AgentDispatcher: Send + Sync + 'static {
    /// Ask `agent_id` to perform `action` with already-resolved parameters.
    fn dispatch(
        &self,
        agent_id: &str,
        action: &str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}
