use std::collections::HashMap;
use std::sync::RwLock;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::config::AgentConfig;
use weft_core::error::Result;
use weft_core::traits::{AgentDirectory, AgentDispatcher};
use weft_core::types::AgentDescriptor;

/// In-memory agent directory, seeded from `[[agents]]`.
#[derive(Default)]
pub struct StaticAgentDirectory {
    agents: RwLock<HashMap<String, AgentDescriptor>>,
}

impl StaticAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(agents: &[AgentConfig]) -> Self {
        let dir = Self::new();
        for agent in agents {
            dir.register(AgentDescriptor::from(agent));
        }
        dir
    }

    pub fn with_agent(self, agent: AgentDescriptor) -> Self {
        self.register(agent);
        self
    }

    pub fn register(&self, agent: AgentDescriptor) {
        let mut agents = self.agents.write().unwrap_or_else(|p| p.into_inner());
        agents.insert(agent.id.clone(), agent);
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AgentDirectory for StaticAgentDirectory {
    fn get_agent(&self, agent_id: &str) -> BoxFuture<'_, Option<AgentDescriptor>> {
        let found = self
            .agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(agent_id)
            .cloned();
        Box::pin(async move { found })
    }
}

/// Dispatcher that answers every call with its own input.
pub struct EchoDispatcher;

impl AgentDispatcher for EchoDispatcher {
    fn dispatch(&self, agent_id: &str, action: &str, parameters: Value) -> BoxFuture<'_, Result<Value>> {
        debug!(agent = %agent_id, action = %action, "Echo dispatch");
        let reply = json!({
            "agentId": agent_id,
            "action": action,
            "parameters": parameters,
        });
        Box::pin(async move { Ok(reply) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_lookup() {
        let dir = StaticAgentDirectory::from_config(&[AgentConfig {
            id: "crm".into(),
            name: Some("CRM".into()),
            capabilities: vec!["lookup".into()],
        }])
        .with_agent(AgentDescriptor::new("mail"));

        assert_eq!(dir.len(), 2);
        let crm = dir.get_agent("crm").await.unwrap();
        assert_eq!(crm.name, "CRM");
        assert!(dir.get_agent("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_echo_returns_input() {
        let reply = EchoDispatcher
            .dispatch("crm", "lookup", json!({ "user": "ada" }))
            .await
            .unwrap();
        assert_eq!(reply["action"], "lookup");
        assert_eq!(reply["parameters"]["user"], "ada");
    }
}
