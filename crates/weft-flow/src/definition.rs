use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::types::Backoff;

/// A flow: an ordered list of steps plus initial variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Step invoked once when another step fails for good.
    #[serde(default)]
    pub error_step: Option<String>,
}

/// One unit of work inside a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Bound on a single attempt.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Variable that receives the step result on completion.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// What a step does, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Dispatch `action` to an agent with template-resolved parameters.
    Task {
        #[serde(rename = "agentId", default)]
        agent_id: String,
        #[serde(default)]
        action: String,
        #[serde(default)]
        parameters: Value,
    },
    /// Run `on_true` or `on_false` depending on `expression`.
    Condition {
        expression: String,
        #[serde(rename = "onTrue", default)]
        on_true: Option<String>,
        #[serde(rename = "onFalse", default)]
        on_false: Option<String>,
    },
    /// Re-run the body up to `max_iterations` times while `condition` holds.
    Loop {
        steps: Vec<String>,
        #[serde(rename = "maxIterations")]
        max_iterations: u32,
        #[serde(default)]
        condition: Option<String>,
    },
    /// Run the listed steps concurrently and join on all of them.
    Parallel { steps: Vec<String> },
    /// Sleep, interruptible by cancellation.
    Wait {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
}

impl StepKind {
    /// Steps this kind invokes itself.
    pub fn owned_steps(&self) -> Vec<&str> {
        match self {
            Self::Condition { on_true, on_false, .. } => on_true
                .iter()
                .chain(on_false.iter())
                .map(String::as_str)
                .collect(),
            Self::Loop { steps, .. } | Self::Parallel { steps } => {
                steps.iter().map(String::as_str).collect()
            }
            Self::Task { .. } | Self::Wait { .. } => Vec::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Task { .. } => "task",
            Self::Condition { .. } => "condition",
            Self::Loop { .. } => "loop",
            Self::Parallel { .. } => "parallel",
            Self::Wait { .. } => "wait",
        }
    }
}

/// Bounded retry for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Step {
    fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            dependencies: Vec::new(),
            retry: None,
            timeout_ms: None,
            output: None,
            kind,
        }
    }

    pub fn task(id: impl Into<String>, agent_id: impl Into<String>, action: impl Into<String>, parameters: Value) -> Self {
        Self::new(
            id,
            StepKind::Task {
                agent_id: agent_id.into(),
                action: action.into(),
                parameters,
            },
        )
    }

    pub fn condition(
        id: impl Into<String>,
        expression: impl Into<String>,
        on_true: Option<&str>,
        on_false: Option<&str>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Condition {
                expression: expression.into(),
                on_true: on_true.map(String::from),
                on_false: on_false.map(String::from),
            },
        )
    }

    pub fn repeat(id: impl Into<String>, body: &[&str], max_iterations: u32, condition: Option<&str>) -> Self {
        Self::new(
            id,
            StepKind::Loop {
                steps: body.iter().map(|s| s.to_string()).collect(),
                max_iterations,
                condition: condition.map(String::from),
            },
        )
    }

    pub fn parallel(id: impl Into<String>, steps: &[&str]) -> Self {
        Self::new(
            id,
            StepKind::Parallel {
                steps: steps.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn wait(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, StepKind::Wait { duration_ms })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_output(mut self, variable: impl Into<String>) -> Self {
        self.output = Some(variable.into());
        self
    }

    /// Display name, falling back to the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps,
            variables: Map::new(),
            error_step: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_error_step(mut self, step_id: impl Into<String>) -> Self {
        self.error_step = Some(step_id.into());
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a definition from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::FlowNotFound(path.display().to_string()))?;
        Self::from_json(&content)
            .map_err(|e| WeftError::Validation(format!("{}: {}", path.display(), e)))
    }

    /// Load every `*.json` definition in `dir`. Unparseable files are skipped.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut flows = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::load(&path) {
                Ok(flow) => flows.push(flow),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping flow definition"),
            }
        }
        info!(dir = %dir.display(), count = flows.len(), "Loaded flow definitions");
        Ok(flows)
    }
}
