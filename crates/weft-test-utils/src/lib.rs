//! Shared fixtures for Weft tests: a temp-dir config, an event recorder,
//! and a scriptable agent dispatcher.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::config::{AgentConfig, AppConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::AgentDispatcher;

/// Config rooted in `dir` with fast timers and fsync off.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.log.dir = dir.join("events").display().to_string();
    config.log.partitions = 4;
    config.log.fsync = false;
    config.bus.flush_interval_ms = 10;
    config.bus.default_retry_delay_ms = 10;
    config.bus.default_max_retries = 0;
    config.agents = vec![
        AgentConfig {
            id: "agent-1".into(),
            name: Some("Agent One".into()),
            capabilities: vec!["process".into()],
        },
        AgentConfig {
            id: "agent-2".into(),
            name: None,
            capabilities: vec![],
        },
    ];
    config
}

/// Write `content` to a temp TOML file and load it.
pub fn load_config_str(content: &str) -> Result<AppConfig> {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .map_err(WeftError::Io)?;
    std::io::Write::write_all(&mut file, content.as_bytes())?;
    AppConfig::load(file.path())
}

/// Thread-safe collector for anything a test wants to observe.
#[derive(Clone)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` items arrived, panicking after `timeout`.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= n {
                return self.items();
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {} items, got {}", n, self.len());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl<T: Clone + Send + 'static> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded dispatch call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchCall {
    pub agent_id: String,
    pub action: String,
    pub parameters: Value,
}

#[derive(Default)]
struct Script {
    /// Remaining failures per action; `u32::MAX` fails forever.
    failures: HashMap<String, u32>,
    responses: HashMap<String, Value>,
    delays: HashMap<String, Duration>,
}

/// Agent dispatcher with scripted failures, responses, and delays.
///
/// Unscripted actions succeed with `{"ok": true, "action": <action>}`.
#[derive(Default)]
pub struct MockDispatcher {
    calls: Mutex<Vec<DispatchCall>>,
    script: Mutex<Script>,
}

impl MockDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` calls of `action`.
    pub fn fail_times(&self, action: &str, n: u32) {
        self.script.lock().unwrap().failures.insert(action.into(), n);
    }

    pub fn always_fail(&self, action: &str) {
        self.fail_times(action, u32::MAX);
    }

    pub fn respond(&self, action: &str, value: Value) {
        self.script.lock().unwrap().responses.insert(action.into(), value);
    }

    pub fn delay(&self, action: &str, delay: Duration) {
        self.script.lock().unwrap().delays.insert(action.into(), delay);
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.action == action)
            .count()
    }
}

impl AgentDispatcher for MockDispatcher {
    fn dispatch(
        &self,
        agent_id: &str,
        action: &str,
        parameters: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        self.calls.lock().unwrap().push(DispatchCall {
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            parameters,
        });

        let (fail, response, delay) = {
            let mut script = self.script.lock().unwrap();
            let fail = match script.failures.get_mut(action) {
                Some(n) if *n == u32::MAX => true,
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            (
                fail,
                script.responses.get(action).cloned(),
                script.delays.get(action).copied(),
            )
        };
        let agent = agent_id.to_string();
        let action = action.to_string();

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if fail {
                return Err(WeftError::Dispatch {
                    agent,
                    message: format!("scripted failure for {}", action),
                });
            }
            Ok(response.unwrap_or_else(|| serde_json::json!({ "ok": true, "action": action })))
        })
    }
}
