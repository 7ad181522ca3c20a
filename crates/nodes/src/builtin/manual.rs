use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ExecutionContext, NodeError, NodeHandler, NodeResult};

/// Entry node for manually triggered runs: echoes the trigger payload.
pub struct ManualNode;

#[async_trait]
impl NodeHandler for ManualNode {
    async fn execute(&self, _config: &Value, ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        Ok(NodeResult::ok(ctx.get_variable("trigger", json!({}))))
    }
}
