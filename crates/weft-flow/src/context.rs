use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use weft_core::types::{ExecutionStatus, StepStatus};

use crate::definition::FlowDefinition;

/// Per-step bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Attempts made beyond the first.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The innermost loop iteration a step runs under.
///
/// Frames travel with each call path, so loops running side by side under a
/// `parallel` step never see each other's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoopFrame {
    pub step_id: String,
    pub index: u32,
}

/// Mutable state of one flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContext {
    pub flow_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub steps: BTreeMap<String, StepRecord>,
    pub variables: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FlowContext {
    /// Fresh context with every step pending. `overrides` win over the
    /// definition's variables.
    pub fn new(flow: &FlowDefinition, execution_id: impl Into<String>, overrides: Option<Map<String, Value>>) -> Self {
        let mut variables = flow.variables.clone();
        if let Some(overrides) = overrides {
            variables.extend(overrides);
        }
        Self {
            flow_id: flow.id.clone(),
            execution_id: execution_id.into(),
            status: ExecutionStatus::Running,
            steps: flow
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepRecord::default()))
                .collect(),
            variables,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    pub fn step_status(&self, id: &str) -> StepStatus {
        self.steps.get(id).map(|r| r.status).unwrap_or_default()
    }

    /// Scope seen by expressions and templates:
    /// `variables`, `steps.<id>.{status,result,error,retryCount}` and `flow`.
    pub fn scope(&self) -> Value {
        self.scope_in(None)
    }

    /// [`scope`](Self::scope) plus `loop.{index,stepId}` when `frame` is set.
    pub(crate) fn scope_in(&self, frame: Option<&LoopFrame>) -> Value {
        let steps: Map<String, Value> = self
            .steps
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    json!({
                        "status": r.status,
                        "result": r.result,
                        "error": r.error,
                        "retryCount": r.retry_count,
                    }),
                )
            })
            .collect();

        let mut scope = json!({
            "variables": self.variables,
            "steps": steps,
            "flow": { "id": self.flow_id, "executionId": self.execution_id },
        });
        if let Some(frame) = frame {
            scope["loop"] = json!({ "index": frame.index, "stepId": frame.step_id });
        }
        scope
    }

    /// Mark every non-terminal step skipped; returns the ids touched.
    pub(crate) fn skip_remaining(&mut self) -> Vec<String> {
        let now = Utc::now();
        self.steps
            .iter_mut()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(id, r)| {
                r.status = StepStatus::Skipped;
                r.completed_at = Some(now);
                id.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Step;

    fn flow() -> FlowDefinition {
        FlowDefinition::new("f", vec![Step::wait("a", 1), Step::wait("b", 1)])
            .with_variable("x", json!(1))
            .with_variable("y", json!("keep"))
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = Map::new();
        overrides.insert("x".into(), json!(2));
        let ctx = FlowContext::new(&flow(), "e1", Some(overrides));
        assert_eq!(ctx.variables["x"], 2);
        assert_eq!(ctx.variables["y"], "keep");
        assert_eq!(ctx.step_status("a"), StepStatus::Pending);
        assert_eq!(ctx.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_scope_shape() {
        let mut ctx = FlowContext::new(&flow(), "e1", None);
        ctx.steps.get_mut("a").unwrap().status = StepStatus::Completed;
        ctx.steps.get_mut("a").unwrap().result = Some(json!({ "n": 3 }));

        let scope = ctx.scope();
        assert_eq!(scope["variables"]["x"], 1);
        assert_eq!(scope["steps"]["a"]["status"], "completed");
        assert_eq!(scope["steps"]["a"]["result"]["n"], 3);
        assert_eq!(scope["flow"]["executionId"], "e1");
        assert!(scope.get("loop").is_none());

        let frame = LoopFrame {
            step_id: "l".into(),
            index: 2,
        };
        let scope = ctx.scope_in(Some(&frame));
        assert_eq!(scope["loop"]["index"], 2);
        assert_eq!(scope["loop"]["stepId"], "l");
        assert_eq!(scope["variables"]["y"], "keep");
    }

    #[test]
    fn test_skip_remaining_leaves_terminal_steps() {
        let mut ctx = FlowContext::new(&flow(), "e1", None);
        ctx.steps.get_mut("a").unwrap().status = StepStatus::Failed;
        let skipped = ctx.skip_remaining();
        assert_eq!(skipped, vec!["b".to_string()]);
        assert_eq!(ctx.step_status("a"), StepStatus::Failed);
        assert_eq!(ctx.step_status("b"), StepStatus::Skipped);
    }

    #[test]
    fn test_serializes_camel_case() {
        let ctx = FlowContext::new(&flow(), "e1", None);
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["flowId"], "f");
        assert_eq!(json["steps"]["a"]["retryCount"], 0);
        assert!(json.get("loop").is_none());
    }
}
