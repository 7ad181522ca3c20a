use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ExecutionContext, NodeError, NodeHandler, NodeResult};

/// Sleeps for `ms` milliseconds (or `seconds`), then outputs `{delayed_ms}`.
pub struct DelayNode;

fn delay_ms(config: &Value) -> Result<u64, NodeError> {
    if let Some(ms) = config.get("ms") {
        return ms
            .as_u64()
            .ok_or_else(|| NodeError::config("delay: 'ms' must be a non-negative integer"));
    }
    if let Some(seconds) = config.get("seconds") {
        return seconds
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| (s * 1000.0).round() as u64)
            .ok_or_else(|| NodeError::config("delay: 'seconds' must be a non-negative number"));
    }
    Ok(0)
}

#[async_trait]
impl NodeHandler for DelayNode {
    async fn execute(&self, config: &Value, _ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        let ms = delay_ms(config)?;
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(NodeResult::ok(json!({ "delayed_ms": ms })))
    }
}
