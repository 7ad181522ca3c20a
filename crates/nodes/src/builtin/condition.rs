use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::condition::{evaluate, parse};
use crate::{ExecutionContext, NodeError, NodeHandler, NodeResult};

/// Evaluates a constrained boolean expression.
///
/// Output: `{"result": bool, "branch": "true" | "false"}`.
pub struct ConditionNode;

#[derive(Deserialize)]
struct ConditionConfig {
    expression: String,
}

#[async_trait]
impl NodeHandler for ConditionNode {
    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        let cfg: ConditionConfig = serde_json::from_value(config.clone())
            .map_err(|e| NodeError::config(format!("condition: {e}")))?;
        let expr = parse(&cfg.expression).map_err(|e| NodeError::config(e.to_string()))?;

        let result = evaluate(&expr, ctx);
        debug!(expression = %cfg.expression, result, "condition evaluated");

        Ok(NodeResult::ok(json!({
            "result": result,
            "branch": if result { "true" } else { "false" },
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn reports_result_and_branch() {
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        ctx.set_variable("intent", json!("search"));

        let hit = ConditionNode
            .execute(&json!({"expression": "intent == 'search'"}), &ctx)
            .await
            .unwrap();
        assert_eq!(hit.output, json!({"result": true, "branch": "true"}));

        let miss = ConditionNode
            .execute(&json!({"expression": "intent == 'code'"}), &ctx)
            .await
            .unwrap();
        assert_eq!(miss.output, json!({"result": false, "branch": "false"}));
    }

    #[tokio::test]
    async fn malformed_expression_is_a_config_error() {
        let ctx = ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4());
        let err = ConditionNode
            .execute(&json!({"expression": "process.exit(1)"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));

        let err = ConditionNode.execute(&json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
