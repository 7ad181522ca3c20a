//! `engine` crate: workflow models, graph validation, the graph executor
//! and the run orchestration around it.

pub mod error;
pub mod executor;
pub mod graph;
pub mod lanes;
pub mod models;
pub mod notifier;
pub mod runtime;

pub use error::EngineError;
pub use executor::{BranchPolicy, ExecutorConfig, GraphExecutor, RunClaim, RunOutcome};
pub use graph::{validate_workflow, Graph};
pub use lanes::{LaneDispatch, LaneRouter};
pub use models::{EdgeSpec, NodeSpec, WorkflowDefinition};
pub use notifier::{BroadcastNotifier, NoopNotifier, Notification, Notifier, StatusEvent};
pub use runtime::{seed_context, RunOptions, RunReport, Runtime, SubmittedRun};

#[cfg(test)]
mod executor_tests;
