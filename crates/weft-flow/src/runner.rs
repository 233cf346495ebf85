use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::FlowRunnerConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::FlowEventHub;
use weft_core::traits::{AgentDirectory, AgentDispatcher};
use weft_core::types::{new_id, ExecutionStatus, FlowEvent, StepStatus};

use crate::context::{FlowContext, LoopFrame, StepRecord};
use crate::definition::{FlowDefinition, Step, StepKind};
use crate::expr;
use crate::plan::{self, ExecutionPlan};

/// One admitted execution in the active table.
struct Execution {
    id: String,
    flow_id: String,
    context: Mutex<FlowContext>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Execution {
    fn lock(&self) -> MutexGuard<'_, FlowContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scope(&self, frame: Option<&LoopFrame>) -> Value {
        self.lock().scope_in(frame)
    }

    /// Block while paused; fail once cancelled.
    async fn checkpoint(&self) -> Result<()> {
        let mut paused = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(WeftError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Executes flow definitions.
///
/// Each call validates the definition into an [`ExecutionPlan`], registers
/// the execution in the active table (bounded by `max_concurrent_executions`),
/// and runs top-level steps in plan order. Condition, loop and parallel steps
/// run the steps they own themselves. Every step status change is broadcast
/// as a [`FlowEvent`].
pub struct FlowRunner {
    config: FlowRunnerConfig,
    directory: Arc<dyn AgentDirectory>,
    dispatcher: Arc<dyn AgentDispatcher>,
    active: Mutex<HashMap<String, Arc<Execution>>>,
    events: FlowEventHub,
}

impl FlowRunner {
    pub fn new(
        config: FlowRunnerConfig,
        directory: Arc<dyn AgentDirectory>,
        dispatcher: Arc<dyn AgentDispatcher>,
    ) -> Self {
        Self {
            config,
            directory,
            dispatcher,
            active: Mutex::new(HashMap::new()),
            events: FlowEventHub::default(),
        }
    }

    /// Receive lifecycle events of every execution.
    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    fn active_table(&self) -> MutexGuard<'_, HashMap<String, Arc<Execution>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(
        &self,
        flow: &FlowDefinition,
        overrides: Option<Map<String, Value>>,
    ) -> Result<(Arc<Execution>, ExecutionPlan)> {
        let plan = plan::plan(flow)?;

        let mut active = self.active_table();
        if active.len() >= self.config.max_concurrent_executions {
            warn!(flow_id = %flow.id, limit = self.config.max_concurrent_executions, "Flow rejected, runner at capacity");
            return Err(WeftError::Capacity {
                what: "concurrent flow executions".into(),
                limit: self.config.max_concurrent_executions,
            });
        }

        let id = new_id();
        let (paused, _) = watch::channel(false);
        let exec = Arc::new(Execution {
            id: id.clone(),
            flow_id: flow.id.clone(),
            context: Mutex::new(FlowContext::new(flow, id.clone(), overrides)),
            paused,
            cancel: CancellationToken::new(),
        });
        active.insert(id, Arc::clone(&exec));
        Ok((exec, plan))
    }

    /// Run a flow to completion on the current task.
    pub async fn execute_flow(
        &self,
        flow: &FlowDefinition,
        overrides: Option<Map<String, Value>>,
    ) -> Result<FlowContext> {
        let (exec, plan) = self.admit(flow, overrides)?;
        self.run(flow, &plan, exec).await
    }

    /// Admit a flow and run it on a spawned task.
    ///
    /// Validation and capacity errors are returned immediately; the handle
    /// resolves to the same result `execute_flow` would.
    pub fn start_flow(
        self: &Arc<Self>,
        flow: FlowDefinition,
        overrides: Option<Map<String, Value>>,
    ) -> Result<(String, JoinHandle<Result<FlowContext>>)> {
        let (exec, plan) = self.admit(&flow, overrides)?;
        let id = exec.id.clone();
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move { runner.run(&flow, &plan, exec).await });
        Ok((id, handle))
    }

    async fn run(&self, flow: &FlowDefinition, plan: &ExecutionPlan, exec: Arc<Execution>) -> Result<FlowContext> {
        info!(
            flow_id = %flow.id,
            execution_id = %exec.id,
            steps = flow.steps.len(),
            "Flow execution started"
        );
        self.events.publish(FlowEvent::ExecutionStarted {
            flow_id: exec.flow_id.clone(),
            execution_id: exec.id.clone(),
        });

        let mut outcome = self.run_top_level(flow, plan, &exec).await;
        if let Err(WeftError::StepFailed { step, message }) = &outcome {
            self.run_error_step(flow, plan, &exec, step, message).await;
        }

        let (context, skipped) = {
            let mut ctx = exec.lock();
            if ctx.status == ExecutionStatus::Cancelled {
                outcome = Err(WeftError::Cancelled);
                (ctx.clone(), Vec::new())
            } else {
                let skipped = ctx.skip_remaining();
                match &outcome {
                    Ok(()) => ctx.status = ExecutionStatus::Completed,
                    Err(WeftError::Cancelled) => ctx.status = ExecutionStatus::Cancelled,
                    Err(e) => {
                        ctx.status = ExecutionStatus::Failed;
                        ctx.error = Some(e.to_string());
                    }
                }
                ctx.finished_at = Some(Utc::now());
                (ctx.clone(), skipped)
            }
        };

        for step_id in skipped {
            self.events.publish(FlowEvent::StepStatusChanged {
                execution_id: exec.id.clone(),
                step_id,
                status: StepStatus::Skipped,
                attempt: 0,
            });
        }
        self.active_table().remove(&exec.id);

        let finished_at = context.finished_at.unwrap_or_else(Utc::now);
        self.events.publish(FlowEvent::ExecutionFinished {
            flow_id: exec.flow_id.clone(),
            execution_id: exec.id.clone(),
            status: context.status,
            error: context.error.clone(),
            finished_at,
        });

        match outcome {
            Ok(()) => {
                info!(flow_id = %flow.id, execution_id = %exec.id, "Flow execution completed");
                Ok(context)
            }
            Err(e) => {
                match &e {
                    WeftError::Cancelled => info!(execution_id = %exec.id, "Flow execution cancelled"),
                    other => error!(flow_id = %flow.id, execution_id = %exec.id, error = %other, "Flow execution failed"),
                }
                Err(e)
            }
        }
    }

    async fn run_top_level(&self, flow: &FlowDefinition, plan: &ExecutionPlan, exec: &Execution) -> Result<()> {
        for &idx in &plan.top_level {
            exec.checkpoint().await?;
            self.execute_step(flow, plan, exec, idx, None).await?;
        }
        Ok(())
    }

    async fn run_error_step(
        &self,
        flow: &FlowDefinition,
        plan: &ExecutionPlan,
        exec: &Execution,
        failed_step: &str,
        message: &str,
    ) {
        let Some(idx) = flow.error_step.as_deref().and_then(|id| plan.index_of(id)) else {
            return;
        };
        if exec.cancel.is_cancelled() {
            return;
        }
        exec.lock().variables.insert(
            "error".into(),
            json!({ "stepId": failed_step, "message": message }),
        );
        info!(execution_id = %exec.id, failed_step, error_step = %flow.steps[idx].id, "Running error step");
        if let Err(e) = self.execute_step(flow, plan, exec, idx, None).await {
            error!(execution_id = %exec.id, error = %e, "Error step failed");
        }
    }

    /// Apply `update` to a step record and broadcast the new status.
    /// No-op once the execution is cancelled.
    fn transition(&self, exec: &Execution, step_id: &str, attempt: u32, update: impl FnOnce(&mut StepRecord)) {
        let status = {
            let mut ctx = exec.lock();
            if exec.cancel.is_cancelled() {
                return;
            }
            let Some(record) = ctx.steps.get_mut(step_id) else {
                return;
            };
            update(record);
            record.status
        };
        self.events.publish(FlowEvent::StepStatusChanged {
            execution_id: exec.id.clone(),
            step_id: step_id.to_string(),
            status,
            attempt,
        });
    }

    fn skip_step(&self, exec: &Execution, step_id: &str) {
        self.transition(exec, step_id, 0, |r| {
            if !r.status.is_terminal() {
                r.status = StepStatus::Skipped;
                r.completed_at = Some(Utc::now());
            }
        });
    }

    /// Run one step with its retry policy. `frame` is the innermost loop
    /// iteration on this call path.
    fn execute_step<'a>(
        &'a self,
        flow: &'a FlowDefinition,
        plan: &'a ExecutionPlan,
        exec: &'a Execution,
        idx: usize,
        frame: Option<&'a LoopFrame>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let step = &flow.steps[idx];
            if exec.cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }

            let unmet: Vec<&String> = {
                let ctx = exec.lock();
                step.dependencies
                    .iter()
                    .filter(|d| ctx.step_status(d) != StepStatus::Completed)
                    .collect()
            };
            if !unmet.is_empty() {
                debug!(execution_id = %exec.id, step_id = %step.id, unmet = ?unmet, "Dependencies not completed, skipping step");
                self.skip_step(exec, &step.id);
                return Ok(());
            }

            let max_attempts = step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
            let timeout_ms = step.timeout_ms.or(self.config.default_step_timeout_ms);
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                self.transition(exec, &step.id, attempt, |r| {
                    r.status = StepStatus::Running;
                    r.retry_count = attempt - 1;
                    r.started_at = Some(Utc::now());
                    r.completed_at = None;
                });
                debug!(
                    execution_id = %exec.id,
                    step_id = %step.id,
                    kind = step.kind.type_name(),
                    attempt,
                    "Running step"
                );

                let run = self.run_kind(flow, plan, exec, step, frame);
                let outcome = match timeout_ms {
                    Some(ms) => tokio::time::timeout(Duration::from_millis(ms), run)
                        .await
                        .unwrap_or_else(|_| {
                            Err(WeftError::StepTimeout {
                                step: step.id.clone(),
                                timeout_ms: ms,
                            })
                        }),
                    None => run.await,
                };

                // A cancelled execution discards whatever the attempt produced.
                if exec.cancel.is_cancelled() {
                    return Err(WeftError::Cancelled);
                }

                match outcome {
                    Ok(result) => {
                        let piped = result.clone();
                        self.transition(exec, &step.id, attempt, |r| {
                            r.status = StepStatus::Completed;
                            r.result = Some(result);
                            r.error = None;
                            r.completed_at = Some(Utc::now());
                        });
                        if let Some(var) = &step.output {
                            exec.lock().variables.insert(var.clone(), piped);
                        }
                        debug!(execution_id = %exec.id, step_id = %step.id, attempt, "Step completed");
                        return Ok(());
                    }
                    Err(WeftError::Cancelled) => return Err(WeftError::Cancelled),
                    Err(e) if attempt < max_attempts => {
                        let delay = step
                            .retry
                            .as_ref()
                            .map(|r| r.backoff.delay(Duration::from_millis(r.delay_ms), attempt))
                            .unwrap_or_default();
                        warn!(
                            execution_id = %exec.id,
                            step_id = %step.id,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Step attempt failed, retrying"
                        );
                        let message = e.to_string();
                        self.transition(exec, &step.id, attempt, |r| {
                            r.status = StepStatus::Pending;
                            r.error = Some(message);
                        });
                        tokio::select! {
                            _ = exec.cancel.cancelled() => return Err(WeftError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        // Keep the innermost failing step when an owned step failed.
                        let failure = match e {
                            WeftError::StepFailed { .. } => e,
                            other => WeftError::StepFailed {
                                step: step.id.clone(),
                                message: other.to_string(),
                            },
                        };
                        let message = match &failure {
                            WeftError::StepFailed { message, .. } => message.clone(),
                            other => other.to_string(),
                        };
                        self.transition(exec, &step.id, attempt, |r| {
                            r.status = StepStatus::Failed;
                            r.error = Some(message);
                            r.completed_at = Some(Utc::now());
                        });
                        warn!(execution_id = %exec.id, step_id = %step.id, attempts = attempt, "Step failed");
                        return Err(failure);
                    }
                }
            }
        })
    }

    fn run_owned<'a>(
        &'a self,
        flow: &'a FlowDefinition,
        plan: &'a ExecutionPlan,
        exec: &'a Execution,
        step_id: &'a str,
        frame: Option<&'a LoopFrame>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let idx = plan
                .index_of(step_id)
                .ok_or_else(|| WeftError::Validation(format!("unknown step '{}'", step_id)))?;
            self.execute_step(flow, plan, exec, idx, frame).await
        })
    }

    async fn run_kind(
        &self,
        flow: &FlowDefinition,
        plan: &ExecutionPlan,
        exec: &Execution,
        step: &Step,
        frame: Option<&LoopFrame>,
    ) -> Result<Value> {
        match &step.kind {
            StepKind::Task {
                agent_id,
                action,
                parameters,
            } => {
                let parameters = expr::resolve_template(parameters, &exec.scope(frame));
                let agent = self
                    .directory
                    .get_agent(agent_id)
                    .await
                    .ok_or_else(|| WeftError::AgentNotFound(agent_id.clone()))?;
                debug!(step_id = %step.id, agent = %agent.id, action = %action, "Dispatching task");
                self.dispatcher.dispatch(&agent.id, action, parameters).await
            }

            StepKind::Condition {
                expression,
                on_true,
                on_false,
            } => {
                let passed = expr::evaluate(expression, &exec.scope(frame));
                let (chosen, other) = if passed {
                    (on_true, on_false)
                } else {
                    (on_false, on_true)
                };
                if let Some(other) = other {
                    if chosen.as_ref() != Some(other) {
                        self.skip_step(exec, other);
                    }
                }
                debug!(step_id = %step.id, expression = %expression, passed, branch = ?chosen, "Condition evaluated");
                if let Some(target) = chosen {
                    self.run_owned(flow, plan, exec, target, frame).await?;
                }
                Ok(json!({ "result": passed, "branch": chosen }))
            }

            StepKind::Loop {
                steps,
                max_iterations,
                condition,
            } => {
                let mut iterations = Vec::new();
                for index in 0..*max_iterations {
                    let frame = LoopFrame {
                        step_id: step.id.clone(),
                        index,
                    };
                    let outcome = self
                        .run_iteration(flow, plan, exec, steps, condition.as_deref(), &frame)
                        .await?;
                    match outcome {
                        Some(results) => iterations.push(results),
                        None => break,
                    }
                }
                debug!(step_id = %step.id, iterations = iterations.len(), "Loop finished");
                Ok(json!({ "iterations": iterations.len(), "results": iterations }))
            }

            StepKind::Parallel { steps } => {
                let outcomes = join_all(
                    steps
                        .iter()
                        .map(|id| self.run_owned(flow, plan, exec, id.as_str(), frame)),
                )
                .await;
                if let Some(err) = outcomes.into_iter().find_map(|r| r.err()) {
                    return Err(err);
                }
                let ctx = exec.lock();
                let results: Map<String, Value> = steps
                    .iter()
                    .map(|id| {
                        let result = ctx.step(id).and_then(|r| r.result.clone()).unwrap_or(Value::Null);
                        (id.clone(), result)
                    })
                    .collect();
                Ok(Value::Object(results))
            }

            StepKind::Wait { duration_ms } => {
                tokio::select! {
                    _ = exec.cancel.cancelled() => Err(WeftError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(*duration_ms)) => Ok(Value::Null),
                }
            }
        }
    }

    /// One loop pass: `None` when the continuation predicate stops the loop.
    async fn run_iteration(
        &self,
        flow: &FlowDefinition,
        plan: &ExecutionPlan,
        exec: &Execution,
        body: &[String],
        condition: Option<&str>,
        frame: &LoopFrame,
    ) -> Result<Option<Value>> {
        if let Some(condition) = condition {
            if !expr::evaluate(condition, &exec.scope(Some(frame))) {
                return Ok(None);
            }
        }
        exec.checkpoint().await?;

        for id in body {
            self.transition(exec, id, 0, |r| *r = StepRecord::default());
        }
        let mut results = Map::new();
        for id in body {
            self.run_owned(flow, plan, exec, id, Some(frame)).await?;
            let result = exec
                .lock()
                .step(id)
                .and_then(|r| r.result.clone())
                .unwrap_or(Value::Null);
            results.insert(id.clone(), result);
        }
        Ok(Some(Value::Object(results)))
    }

    fn find(&self, execution_id: &str) -> Result<Arc<Execution>> {
        self.active_table()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| WeftError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Pause before the next step starts.
    pub fn pause_flow(&self, execution_id: &str) -> Result<()> {
        let exec = self.find(execution_id)?;
        exec.paused.send_replace(true);
        exec.lock().status = ExecutionStatus::Paused;
        info!(execution_id, "Flow paused");
        Ok(())
    }

    pub fn resume_flow(&self, execution_id: &str) -> Result<()> {
        let exec = self.find(execution_id)?;
        exec.lock().status = ExecutionStatus::Running;
        exec.paused.send_replace(false);
        info!(execution_id, "Flow resumed");
        Ok(())
    }

    /// Cancel an execution: remaining steps become skipped and it leaves the
    /// active table at once. Dispatches already in flight finish unobserved.
    pub fn cancel_flow(&self, execution_id: &str) -> Result<()> {
        let exec = self
            .active_table()
            .remove(execution_id)
            .ok_or_else(|| WeftError::ExecutionNotFound(execution_id.to_string()))?;

        let skipped = {
            let mut ctx = exec.lock();
            let skipped = ctx.skip_remaining();
            ctx.status = ExecutionStatus::Cancelled;
            ctx.finished_at = Some(Utc::now());
            exec.cancel.cancel();
            skipped
        };
        for step_id in skipped {
            self.events.publish(FlowEvent::StepStatusChanged {
                execution_id: exec.id.clone(),
                step_id,
                status: StepStatus::Skipped,
                attempt: 0,
            });
        }
        info!(execution_id, "Flow cancelled");
        Ok(())
    }

    /// Snapshot of an active execution.
    pub fn get_flow_status(&self, execution_id: &str) -> Option<FlowContext> {
        self.active_table()
            .get(execution_id)
            .map(|exec| exec.lock().clone())
    }

    pub fn active_executions(&self) -> Vec<String> {
        self.active_table().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_table().len()
    }
}
