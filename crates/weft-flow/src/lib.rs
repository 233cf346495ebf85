//! Flow runner: validates a flow definition into a dependency-ordered plan
//! and executes it step by step against an agent directory and dispatcher.

pub mod agents;
pub mod context;
pub mod definition;
pub mod expr;
pub mod plan;
pub mod runner;

pub use agents::{EchoDispatcher, StaticAgentDirectory};
pub use context::{FlowContext, StepRecord};
pub use definition::{FlowDefinition, RetryPolicy, Step, StepKind};
pub use plan::ExecutionPlan;
pub use runner::FlowRunner;
