//! Built-in node handlers.
//!
//! `llm`, `database` and `communication` have no built-in: applications
//! register their own connector handlers.

mod api;
mod condition;
mod delay;
mod manual;
mod transform;

use std::sync::Arc;

pub use api::ApiNode;
pub use condition::ConditionNode;
pub use delay::DelayNode;
pub use manual::ManualNode;
pub use transform::TransformNode;

use crate::NodeRegistry;

/// Register every built-in handler under its type tag.
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register("manual", Arc::new(ManualNode));
    registry.register("transform", Arc::new(TransformNode));
    registry.register("condition", Arc::new(ConditionNode));
    registry.register("delay", Arc::new(DelayNode));
    registry.register("api", Arc::new(ApiNode::new()));
}
