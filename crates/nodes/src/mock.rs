//! `MockNode`: a test double for `NodeHandler`.
//!
//! Useful in unit and integration tests where a real connector is either
//! unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{ExecutionContext, NodeError, NodeHandler, NodeResult};

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Return `success: false` with the given error, without raising.
    ReportFailure(String),
    /// Raise the given error.
    Raise(NodeError),
}

/// A mock node that records every config it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All (interpolated) configs seen by this node, in call order.
    calls: Arc<Mutex<Vec<Value>>>,
}

impl MockNode {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that reports a remote failure (`success: false`).
    pub fn reporting_failure(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReportFailure(msg.into()))
    }

    /// Create a mock that always raises an execution error.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Raise(NodeError::execution(msg)))
    }

    /// Create a mock that always raises a configuration error.
    pub fn misconfigured(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Raise(NodeError::config(msg)))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Value>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    /// Configs received so far.
    pub fn calls(&self) -> Vec<Value> {
        self.lock().clone()
    }
}

#[async_trait]
impl NodeHandler for MockNode {
    async fn execute(&self, config: &Value, _ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        self.lock().push(config.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                // Merge the node's label into its output so tests can trace
                // which mock produced what.
                let mut out = json!({ "node": self.name });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(NodeResult::ok(out))
            }
            MockBehaviour::ReportFailure(msg) => {
                Ok(NodeResult::failure(msg.clone(), json!({ "node": self.name })))
            }
            MockBehaviour::Raise(err) => Err(err.clone()),
        }
    }
}
