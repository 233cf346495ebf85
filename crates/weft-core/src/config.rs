use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: EventLogConfig,
    #[serde(default)]
    pub bus: EventBusConfig,
    #[serde(default)]
    pub flow: FlowRunnerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// On-disk event log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Base directory holding one sub-directory per partition.
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Number of partitions. Changing this remaps topics to partitions.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Segment size that triggers rotation to a new segment file.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,
    /// Write segments as `.log.gz` (one gzip member per batch).
    #[serde(default)]
    pub compression: bool,
    /// Segments whose mtime is older than this are deleted by the retention sweep.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Call `fsync` after every batch write.
    #[serde(default = "default_fsync")]
    pub fsync: bool,
    /// Verify each entry's checksum while reading.
    #[serde(default)]
    pub verify_checksums: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            partitions: default_partitions(),
            max_segment_bytes: default_max_segment_bytes(),
            compression: false,
            retention_hours: default_retention_hours(),
            fsync: default_fsync(),
            verify_checksums: false,
        }
    }
}

impl EventLogConfig {
    /// Resolve the log directory (expand ~).
    pub fn dir_path(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

fn default_log_dir() -> String { "~/.weft/events".to_string() }
fn default_partitions() -> usize { 4 }
fn default_max_segment_bytes() -> u64 { 64 * 1024 * 1024 }
fn default_retention_hours() -> u64 { 168 }
fn default_fsync() -> bool { true }

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Pending buffer size that forces an inline flush.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Interval of the background flush timer.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Interval of the background retention sweep.
    #[serde(default = "default_retention_check_interval_secs")]
    pub retention_check_interval_secs: u64,
    /// Default transaction timeout before auto-abort.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// Delivery retries for subscriptions that don't set their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Base retry delay for subscriptions that don't set their own.
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
    /// Advisory replication factor stamped on every entry.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            retention_check_interval_secs: default_retention_check_interval_secs(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            default_max_retries: default_max_retries(),
            default_retry_delay_ms: default_retry_delay_ms(),
            replication_factor: default_replication_factor(),
        }
    }
}

fn default_max_batch_size() -> usize { 100 }
fn default_flush_interval_ms() -> u64 { 100 }
fn default_retention_check_interval_secs() -> u64 { 3600 }
fn default_transaction_timeout_ms() -> u64 { 30_000 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_replication_factor() -> u32 { 1 }

/// Flow runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunnerConfig {
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    /// Timeout applied to each attempt of a step that doesn't set its own.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,
}

impl Default for FlowRunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
            default_step_timeout_ms: None,
        }
    }
}

fn default_max_concurrent_executions() -> usize { 10 }

/// Orchestration rule matcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_orchestrator_enabled")]
    pub enabled: bool,
    /// JSON file holding a list of orchestration rules.
    #[serde(default)]
    pub rules_path: Option<String>,
    /// Directory of `*.json` flow definitions.
    #[serde(default)]
    pub flows_dir: Option<String>,
    /// Number of execution ids remembered per rule.
    #[serde(default = "default_max_tracked_executions")]
    pub max_tracked_executions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: default_orchestrator_enabled(),
            rules_path: None,
            flows_dir: None,
            max_tracked_executions: default_max_tracked_executions(),
        }
    }
}

fn default_orchestrator_enabled() -> bool { true }
fn default_max_tracked_executions() -> usize { 100 }

/// A statically configured agent, seeding the in-repo agent directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "weft=debug,warn".
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String { "weft=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime can't operate with.
    pub fn validate(&self) -> Result<()> {
        if self.log.partitions == 0 {
            return Err(WeftError::Config("log.partitions must be at least 1".into()));
        }
        if self.log.max_segment_bytes == 0 {
            return Err(WeftError::Config("log.max_segment_bytes must be positive".into()));
        }
        if self.bus.max_batch_size == 0 {
            return Err(WeftError::Config("bus.max_batch_size must be at least 1".into()));
        }
        if self.flow.max_concurrent_executions == 0 {
            return Err(WeftError::Config(
                "flow.max_concurrent_executions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.log.partitions, 4);
        assert_eq!(config.log.retention_hours, 168);
        assert!(config.log.fsync);
        assert!(!config.log.compression);
        assert_eq!(config.bus.max_batch_size, 100);
        assert_eq!(config.bus.transaction_timeout_ms, 30_000);
        assert_eq!(config.flow.max_concurrent_executions, 10);
        assert!(config.flow.default_step_timeout_ms.is_none());
        assert!(config.orchestrator.enabled);
        assert!(config.agents.is_empty());
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[log]
dir = "/tmp/weft"
partitions = 8
compression = true

[bus]
max_batch_size = 10

[[agents]]
id = "summarizer"
capabilities = ["text"]
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log.dir_path(), PathBuf::from("/tmp/weft"));
        assert_eq!(config.log.partitions, 8);
        assert!(config.log.compression);
        assert_eq!(config.log.max_segment_bytes, 64 * 1024 * 1024);
        assert_eq!(config.bus.max_batch_size, 10);
        assert_eq!(config.bus.flush_interval_ms, 100);
        assert_eq!(config.agents[0].id, "summarizer");
        assert_eq!(config.agents[0].name, None);
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let mut config = AppConfig::default();
        config.log.partitions = 0;
        assert!(matches!(config.validate(), Err(WeftError::Config(_))));
    }
}
