use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{ExecutionContext, NodeError, NodeHandler, NodeResult};

/// Maps a previous node's output (or the trigger payload) through mapping
/// rules.
pub struct TransformNode;

#[derive(Deserialize)]
struct TransformConfig {
    /// Node whose output is the mapping input. Defaults to the trigger.
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    mapping: Map<String, Value>,
}

#[async_trait]
impl NodeHandler for TransformNode {
    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        let cfg: TransformConfig = serde_json::from_value(config.clone())
            .map_err(|e| NodeError::config(format!("transform: {e}")))?;

        let data = match &cfg.source {
            Some(node_id) => ctx.get_node_output(node_id).cloned().ok_or_else(|| {
                NodeError::execution(format!("transform: node '{node_id}' has no output yet"))
            })?,
            None => ctx.get_variable("trigger", Value::Object(Map::new())),
        };

        Ok(NodeResult::ok(ctx.transform(&data, &cfg.mapping)))
    }
}
