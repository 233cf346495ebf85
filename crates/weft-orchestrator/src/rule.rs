use std::collections::VecDeque;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::topic::TopicPattern;
use weft_core::types::new_id;

fn any() -> String {
    "*".to_string()
}

fn default_enabled() -> bool {
    true
}

/// One way an event can start a rule's flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(default = "new_id")]
    pub id: String,
    /// Exact event type, or `*`.
    #[serde(default = "any")]
    pub event_type: String,
    /// Exact topic, `*`, or a glob such as `orders.*`.
    #[serde(default = "any")]
    pub topic: String,
    /// Evaluated against the event scope; the trigger fires only when true.
    #[serde(default)]
    pub condition: Option<String>,
    /// Static flow variables contributed by this trigger.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// `topic` compiled on first use.
    #[serde(skip)]
    pattern: OnceLock<TopicPattern>,
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.event_type == other.event_type
            && self.topic == other.topic
            && self.condition == other.condition
            && self.parameters == other.parameters
    }
}

impl Trigger {
    pub fn new(event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            event_type: event_type.into(),
            topic: topic.into(),
            condition: None,
            parameters: Map::new(),
            pattern: OnceLock::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(WeftError::Validation(format!("trigger '{}' has an empty event type", self.id)));
        }
        self.with_pattern(|_| ())
    }

    /// Event type and topic both match. The condition is checked separately.
    pub fn matches(&self, event_type: &str, topic: &str) -> bool {
        if self.event_type != "*" && self.event_type != event_type {
            return false;
        }
        self.with_pattern(|p| p.matches(topic)).unwrap_or(false)
    }

    /// Run `f` on the compiled topic pattern. The cached pattern is reused
    /// while it still agrees with `topic`.
    fn with_pattern<T>(&self, f: impl FnOnce(&TopicPattern) -> T) -> Result<T> {
        match self.pattern.get() {
            Some(p) if p.as_str() == self.topic => Ok(f(p)),
            // `topic` was edited after the cache was filled.
            Some(_) => Ok(f(&TopicPattern::parse(&self.topic)?)),
            None => {
                let parsed = TopicPattern::parse(&self.topic)?;
                Ok(f(self.pattern.get_or_init(|| parsed)))
            }
        }
    }
}

/// Binds triggers to a flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub flow_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: u64,
    /// Most recent executions started by this rule, oldest first.
    #[serde(default)]
    pub execution_ids: VecDeque<String>,
}

impl OrchestrationRule {
    pub fn new(id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            flow_id: flow_id.into(),
            enabled: true,
            triggers: Vec::new(),
            last_triggered: None,
            trigger_count: 0,
            execution_ids: VecDeque::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(WeftError::Validation("rule id is empty".into()));
        }
        if self.flow_id.trim().is_empty() {
            return Err(WeftError::Validation(format!("rule '{}' has no flowId", self.id)));
        }
        self.triggers.iter().try_for_each(Trigger::validate)
    }

    /// Record a started execution, keeping at most `max_tracked` ids.
    pub fn record_execution(&mut self, execution_id: String, max_tracked: usize) {
        self.last_triggered = Some(Utc::now());
        self.trigger_count += 1;
        self.execution_ids.push_back(execution_id);
        while self.execution_ids.len() > max_tracked {
            self.execution_ids.pop_front();
        }
    }

    /// Read a JSON array of rules.
    pub fn load_file(path: &Path) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        let rules: Vec<Self> = serde_json::from_str(&content)?;
        rules.iter().try_for_each(Self::validate)?;
        Ok(rules)
    }
}
