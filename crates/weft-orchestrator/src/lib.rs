//! Rule matcher: binds events delivered by the bus to flow executions.
//!
//! An [`Orchestrator`] subscribes to every topic. For each event it checks
//! the enabled [`OrchestrationRule`]s, and the first matching [`Trigger`] of a
//! rule starts that rule's flow with the event available as `variables.event`.

pub mod orchestrator;
pub mod rule;

pub use orchestrator::Orchestrator;
pub use rule::{OrchestrationRule, Trigger};
