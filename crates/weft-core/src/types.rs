use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh random identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A dispatch target known to the agent directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capabilities: vec![],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl From<&crate::config::AgentConfig> for AgentDescriptor {
    fn from(config: &crate::config::AgentConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            capabilities: config.capabilities.clone(),
        }
    }
}

/// Lifecycle of a single step within a flow execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a whole flow execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `delay * attempt`
    Linear,
    /// `delay * 2^(attempt - 1)`
    #[default]
    Exponential,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Linear => base.saturating_mul(attempt),
            Self::Exponential => base.saturating_mul(2u32.saturating_pow(attempt - 1)),
        }
    }
}

/// Flow lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// An execution was admitted and is about to run its first step.
    ExecutionStarted {
        flow_id: String,
        execution_id: String,
    },
    /// A step moved to a new status.
    StepStatusChanged {
        execution_id: String,
        step_id: String,
        status: StepStatus,
        attempt: u32,
    },
    /// An execution reached a terminal status.
    ExecutionFinished {
        flow_id: String,
        execution_id: String,
        status: ExecutionStatus,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_linear_backoff() {
        let base = Duration::from_millis(100);
        assert_eq!(Backoff::Linear.delay(base, 1), Duration::from_millis(100));
        assert_eq!(Backoff::Linear.delay(base, 3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff() {
        let base = Duration::from_millis(100);
        assert_eq!(Backoff::Exponential.delay(base, 1), Duration::from_millis(100));
        assert_eq!(Backoff::Exponential.delay(base, 2), Duration::from_millis(200));
        assert_eq!(Backoff::Exponential.delay(base, 4), Duration::from_millis(800));
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_step_status_serde() {
        let json = serde_json::to_string(&StepStatus::Skipped).unwrap();
        assert_eq!(json, "\"skipped\"");
        let parsed: StepStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, StepStatus::Running);
    }

    #[test]
    fn test_agent_descriptor_from_config() {
        let config = crate::config::AgentConfig {
            id: "writer".into(),
            name: None,
            capabilities: vec!["text".into()],
        };
        let agent = AgentDescriptor::from(&config);
        assert_eq!(agent.name, "writer");
        assert_eq!(agent.capabilities, vec!["text"]);
    }
}
