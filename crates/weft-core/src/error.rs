use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Dependency cycle detected among steps: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    // Capacity errors
    #[error("Capacity exceeded: {what} (limit {limit})")]
    Capacity { what: String, limit: usize },

    // Log errors
    #[error("Checksum mismatch for event {id}: expected {expected}, got {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Event bus is shut down")]
    BusClosed,

    // Transaction errors
    #[error("Transaction timed out: {0}")]
    TransactionTimeout(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Transaction {id} is not active ({status})")]
    TransactionNotActive { id: String, status: String },

    // Delivery errors
    #[error("Delivery to subscriber {subscriber} failed: {message}")]
    Delivery { subscriber: String, message: String },

    // Flow errors
    #[error("Step failed: {step}: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step timeout after {timeout_ms}ms: {step}")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Dispatch to agent {agent} failed: {message}")]
    Dispatch { agent: String, message: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Orchestrator errors
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;
