//! The `NodeHandler` trait: the contract every node type must fulfil.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{ExecutionContext, NodeError};

/// What a handler hands back to the executor.
///
/// `success: false` marks a reported remote failure: the executor treats it
/// like any other completed dispatch and downstream nodes still run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub output: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResult {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            success: true,
            error: None,
        }
    }

    /// A remote or business failure the handler chose not to raise.
    pub fn failure(error: impl Into<String>, output: Value) -> Self {
        Self {
            output,
            success: false,
            error: Some(error.into()),
        }
    }

    /// The value stored in the execution context and on the node record.
    ///
    /// Successful results store their output unchanged.  Failures store an
    /// object carrying `success: false` and `error`, merged over the output's
    /// own fields when the output is an object.
    pub fn into_output(self) -> Value {
        if self.success {
            return self.output;
        }
        let mut obj = match self.output {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut m = Map::new();
                m.insert("output".into(), other);
                m
            }
        };
        obj.insert("success".into(), json!(false));
        obj.insert("error".into(), json!(self.error.unwrap_or_default()));
        Value::Object(obj)
    }
}

/// The core handler trait.
///
/// `config` arrives with every `{{...}}` marker already resolved against
/// `ctx`.  Handlers must not raise for expected remote failures; they may
/// raise [`NodeError::Config`] for configuration problems.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> Result<NodeResult, NodeError>;
}
