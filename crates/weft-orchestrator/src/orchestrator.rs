use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use weft_core::config::OrchestratorConfig;
use weft_core::error::{Result, WeftError};
use weft_events::{handler_fn, EventBus, EventLogEntry, SubscribeOptions};
use weft_flow::{expr, plan, FlowDefinition, FlowRunner};

use crate::rule::{OrchestrationRule, Trigger};

const SUBSCRIBER_ID: &str = "weft.orchestrator";

/// Event as seen by trigger conditions and by the started flow's
/// `event` variable.
fn event_value(event: &EventLogEntry) -> Value {
    json!({
        "id": event.id,
        "type": event.event_type,
        "topic": event.topic,
        "source": event.producer_id,
        "data": event.data,
        "timestamp": event.timestamp,
        "metadata": event.metadata,
    })
}

/// Condition scope: the event's fields at top level plus the whole event
/// under `event`.
fn condition_scope(event: &Value) -> Value {
    let mut scope = match event {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scope.insert("event".into(), event.clone());
    Value::Object(scope)
}

/// A matched rule waiting to launch.
struct Launch {
    rule_id: String,
    flow_id: String,
    parameters: Map<String, Value>,
}

/// Matches bus events against orchestration rules and starts flows.
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: Arc<EventBus>,
    runner: Arc<FlowRunner>,
    rules: RwLock<BTreeMap<String, OrchestrationRule>>,
    flows: RwLock<HashMap<String, FlowDefinition>>,
    subscription: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, bus: Arc<EventBus>, runner: Arc<FlowRunner>) -> Self {
        Self {
            config,
            bus,
            runner,
            rules: RwLock::new(BTreeMap::new()),
            flows: RwLock::new(HashMap::new()),
            subscription: Mutex::new(None),
        }
    }

    /// Build an orchestrator and load the configured flows directory and rules file.
    pub fn from_config(config: OrchestratorConfig, bus: Arc<EventBus>, runner: Arc<FlowRunner>) -> Result<Arc<Self>> {
        let flows_dir = config.flows_dir.clone();
        let rules_path = config.rules_path.clone();
        let orchestrator = Self::new(config, bus, runner);

        if let Some(dir) = flows_dir {
            for flow in FlowDefinition::load_dir(Path::new(&dir))? {
                if let Err(e) = orchestrator.register_flow(flow) {
                    warn!(error = %e, "Skipping invalid flow definition");
                }
            }
        }
        if let Some(path) = rules_path {
            let rules = OrchestrationRule::load_file(Path::new(&path))?;
            info!(path = %path, count = rules.len(), "Loaded orchestration rules");
            for rule in rules {
                orchestrator.add_rule(rule)?;
            }
        }
        Ok(Arc::new(orchestrator))
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Subscribe to every topic on the bus. Calling twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.subscription_slot().is_some() {
            return Ok(());
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let handler = handler_fn(move |event: EventLogEntry| {
            let weak = weak.clone();
            async move {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.handle_event(&event);
                }
                Ok(())
            }
        });
        let id = self
            .bus
            .subscribe(SUBSCRIBER_ID, "*", handler, SubscribeOptions::new())
            .await?;
        info!(subscription = %id, rules = self.rule_count(), "Orchestrator started");
        *self.subscription_slot() = Some(id);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(id) = self.subscription_slot().take() {
            self.bus.unsubscribe(&id);
            info!("Orchestrator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.subscription_slot().is_some()
    }

    fn subscription_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.subscription.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Matching ────────────────────────────────────────────────

    /// Start a flow for every enabled rule with a matching trigger.
    /// Returns the execution ids started.
    pub fn handle_event(&self, event: &EventLogEntry) -> Vec<String> {
        let event_json = event_value(event);
        let scope = condition_scope(&event_json);

        let launches: Vec<Launch> = {
            let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
            rules
                .values()
                .filter(|rule| rule.enabled)
                .filter_map(|rule| {
                    let trigger = rule
                        .triggers
                        .iter()
                        .find(|t| Self::trigger_fires(t, event, &scope))?;
                    debug!(rule_id = %rule.id, trigger_id = %trigger.id, topic = %event.topic, "Trigger matched");
                    Some(Launch {
                        rule_id: rule.id.clone(),
                        flow_id: rule.flow_id.clone(),
                        parameters: trigger.parameters.clone(),
                    })
                })
                .collect()
        };

        launches
            .into_iter()
            .filter_map(|launch| match self.launch(&launch, event_json.clone()) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(rule_id = %launch.rule_id, flow_id = %launch.flow_id, error = %e, "Rule matched but flow did not start");
                    None
                }
            })
            .collect()
    }

    fn trigger_fires(trigger: &Trigger, event: &EventLogEntry, scope: &Value) -> bool {
        trigger.matches(&event.event_type, &event.topic)
            && trigger
                .condition
                .as_deref()
                .map_or(true, |c| expr::evaluate(c, scope))
    }

    /// Variables merge as definition < trigger parameters < `event`.
    fn launch(&self, launch: &Launch, event: Value) -> Result<String> {
        let flow = self
            .flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&launch.flow_id)
            .cloned()
            .ok_or_else(|| WeftError::FlowNotFound(launch.flow_id.clone()))?;

        let mut variables = launch.parameters.clone();
        variables.insert("event".into(), event);
        let (execution_id, _handle) = self.runner.start_flow(flow, Some(variables))?;

        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(rule) = rules.get_mut(&launch.rule_id) {
            rule.record_execution(execution_id.clone(), self.config.max_tracked_executions);
        }
        info!(rule_id = %launch.rule_id, flow_id = %launch.flow_id, execution_id = %execution_id, "Rule triggered flow");
        Ok(execution_id)
    }

    /// Start a rule's flow without an event. Works on disabled rules too.
    pub fn fire_rule(&self, rule_id: &str, data: Value) -> Result<String> {
        let flow_id = self
            .get_rule(rule_id)
            .map(|r| r.flow_id)
            .ok_or_else(|| WeftError::RuleNotFound(rule_id.to_string()))?;
        let event = json!({
            "id": weft_core::types::new_id(),
            "type": "manual",
            "topic": "manual",
            "source": SUBSCRIBER_ID,
            "data": data,
            "timestamp": Utc::now(),
            "metadata": {},
        });
        let launch = Launch {
            rule_id: rule_id.to_string(),
            flow_id,
            parameters: Map::new(),
        };
        self.launch(&launch, event)
    }

    // ── Rules ───────────────────────────────────────────────────

    pub fn add_rule(&self, rule: OrchestrationRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules.contains_key(&rule.id) {
            return Err(WeftError::Validation(format!("rule '{}' already exists", rule.id)));
        }
        info!(rule_id = %rule.id, flow_id = %rule.flow_id, triggers = rule.triggers.len(), "Rule added");
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<OrchestrationRule> {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(rule_id)
            .ok_or_else(|| WeftError::RuleNotFound(rule_id.to_string()))
    }

    fn update_rule<T>(&self, rule_id: &str, f: impl FnOnce(&mut OrchestrationRule) -> Result<T>) -> Result<T> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| WeftError::RuleNotFound(rule_id.to_string()))?;
        f(rule)
    }

    pub fn enable_rule(&self, rule_id: &str) -> Result<()> {
        self.update_rule(rule_id, |r| {
            r.enabled = true;
            Ok(())
        })
    }

    pub fn disable_rule(&self, rule_id: &str) -> Result<()> {
        self.update_rule(rule_id, |r| {
            r.enabled = false;
            Ok(())
        })
    }

    /// Append a trigger; returns its id.
    pub fn add_trigger(&self, rule_id: &str, trigger: Trigger) -> Result<String> {
        trigger.validate()?;
        self.update_rule(rule_id, |r| {
            if r.triggers.iter().any(|t| t.id == trigger.id) {
                return Err(WeftError::Validation(format!("trigger '{}' already exists", trigger.id)));
            }
            let id = trigger.id.clone();
            r.triggers.push(trigger);
            Ok(id)
        })
    }

    pub fn remove_trigger(&self, rule_id: &str, trigger_id: &str) -> Result<Trigger> {
        self.update_rule(rule_id, |r| {
            let pos = r
                .triggers
                .iter()
                .position(|t| t.id == trigger_id)
                .ok_or_else(|| WeftError::Validation(format!("rule '{}' has no trigger '{}'", r.id, trigger_id)))?;
            Ok(r.triggers.remove(pos))
        })
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<OrchestrationRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rule_id)
            .cloned()
    }

    /// All rules, ordered by id.
    pub fn rules(&self) -> Vec<OrchestrationRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    // ── Flows ───────────────────────────────────────────────────

    /// Register a flow definition after validating it. Replaces any flow
    /// with the same id.
    pub fn register_flow(&self, flow: FlowDefinition) -> Result<()> {
        plan::plan(&flow)?;
        debug!(flow_id = %flow.id, steps = flow.steps.len(), "Flow registered");
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(flow.id.clone(), flow);
        Ok(())
    }

    pub fn remove_flow(&self, flow_id: &str) -> Option<FlowDefinition> {
        self.flows.write().unwrap_or_else(PoisonError::into_inner).remove(flow_id)
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(topic: &str, event_type: &str, data: Value) -> EventLogEntry {
        EventLogEntry {
            id: "ev-1".into(),
            sequence_number: 7,
            timestamp: Utc::now(),
            topic: topic.into(),
            event_type: event_type.into(),
            producer_id: "shop".into(),
            data,
            metadata: BTreeMap::from([("region".to_string(), "eu".to_string())]),
            partition: 0,
            offset: 3,
            replication_factor: 1,
            checksum: String::new(),
        }
    }

    #[test]
    fn test_condition_scope_exposes_fields_twice() {
        let event = event_value(&entry("orders", "created", json!({ "priority": "high" })));
        let scope = condition_scope(&event);
        assert!(expr::evaluate("data.priority == 'high'", &scope));
        assert!(expr::evaluate("event.source == 'shop'", &scope));
        assert!(expr::evaluate("metadata.region == 'eu'", &scope));
        assert!(expr::evaluate("type == 'created'", &scope));
        assert!(!expr::evaluate("event.topic == 'billing'", &scope));
    }

    #[test]
    fn test_trigger_condition_gates_match() {
        let event = entry("orders.eu", "created", json!({ "priority": "low" }));
        let scope = condition_scope(&event_value(&event));
        let t = Trigger::new("created", "orders.*");
        assert!(Orchestrator::trigger_fires(&t, &event, &scope));

        let gated = t.clone().with_condition("data.priority == 'high'");
        assert!(!Orchestrator::trigger_fires(&gated, &event, &scope));

        let malformed = Trigger::new("created", "orders.*").with_condition("data.priority ==");
        assert!(!Orchestrator::trigger_fires(&malformed, &event, &scope));
    }
}
