use std::collections::{BTreeSet, HashMap, HashSet};

use weft_core::error::{Result, WeftError};

use crate::definition::{FlowDefinition, StepKind};

/// Validated execution order for a flow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// Every step, topologically ordered over dependencies and ownership.
    pub order: Vec<usize>,
    /// Steps run directly by the runner, in order. Owned steps and the error
    /// step are excluded.
    pub top_level: Vec<usize>,
    /// Owned step id -> owning step id.
    pub owners: HashMap<String, String>,
    index: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Position of a step in the definition.
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.index.get(step_id).copied()
    }

    pub fn is_owned(&self, step_id: &str) -> bool {
        self.owners.contains_key(step_id)
    }
}

/// Validate `flow` and order its steps with Kahn's algorithm.
///
/// Edges run from each dependency to its dependent and from each owner to
/// the steps it invokes. Among ready steps the earliest declared goes first.
pub fn plan(flow: &FlowDefinition) -> Result<ExecutionPlan> {
    let mut index = HashMap::with_capacity(flow.steps.len());
    for (i, step) in flow.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(WeftError::Validation(format!("step #{} has an empty id", i)));
        }
        if index.insert(step.id.clone(), i).is_some() {
            return Err(WeftError::Validation(format!("duplicate step id '{}'", step.id)));
        }
    }

    let resolve = |from: &str, target: &str, what: &str| -> Result<usize> {
        index.get(target).copied().ok_or_else(|| {
            WeftError::Validation(format!("step '{}' references unknown {} '{}'", from, what, target))
        })
    };

    let mut owners: HashMap<String, String> = HashMap::new();
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); flow.steps.len()];
    let mut in_degree = vec![0usize; flow.steps.len()];

    for (i, step) in flow.steps.iter().enumerate() {
        match &step.kind {
            StepKind::Task { agent_id, action, .. } => {
                if agent_id.trim().is_empty() || action.trim().is_empty() {
                    return Err(WeftError::Validation(format!(
                        "task step '{}' needs both agentId and action",
                        step.id
                    )));
                }
            }
            StepKind::Loop { max_iterations: 0, .. } => {
                return Err(WeftError::Validation(format!(
                    "loop step '{}' needs maxIterations >= 1",
                    step.id
                )));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for dep in &step.dependencies {
            let d = resolve(&step.id, dep, "dependency")?;
            if seen.insert(d) {
                edges[d].push(i);
                in_degree[i] += 1;
            }
        }

        for owned in step.kind.owned_steps() {
            let o = resolve(&step.id, owned, "target")?;
            if let Some(previous) = owners.get(owned) {
                if previous != &step.id {
                    return Err(WeftError::Validation(format!(
                        "step '{}' is targeted by both '{}' and '{}'",
                        owned, previous, step.id
                    )));
                }
                continue;
            }
            owners.insert(owned.to_string(), step.id.clone());
            edges[i].push(o);
            in_degree[o] += 1;
        }
    }

    if let Some(error_step) = &flow.error_step {
        if !index.contains_key(error_step) {
            return Err(WeftError::Validation(format!("unknown error step '{}'", error_step)));
        }
        if owners.contains_key(error_step) {
            return Err(WeftError::Validation(format!(
                "error step '{}' cannot be the target of another step",
                error_step
            )));
        }
    }

    let mut ready: BTreeSet<usize> = (0..flow.steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(flow.steps.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &next in &edges[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() < flow.steps.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let stuck = (0..flow.steps.len())
            .filter(|i| !placed.contains(i))
            .map(|i| flow.steps[i].id.clone())
            .collect();
        return Err(WeftError::DependencyCycle(stuck));
    }

    let top_level = order
        .iter()
        .copied()
        .filter(|&i| {
            let id = &flow.steps[i].id;
            !owners.contains_key(id) && flow.error_step.as_deref() != Some(id.as_str())
        })
        .collect();

    Ok(ExecutionPlan {
        order,
        top_level,
        owners,
        index,
    })
}
