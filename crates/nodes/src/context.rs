//! Per-run execution context.
//!
//! Defined here (in the nodes crate) so both the engine and individual node
//! implementations can use it without a circular dependency.  One context is
//! created per run and owned by that run alone; handlers only ever see a
//! shared reference.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::value::{lookup_dotted, lookup_path, ValueKind};

/// A stored variable with its inferred type tag and write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub value: Value,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    pub timestamp: DateTime<Utc>,
}

/// Output recorded for a node, visible to every node executed after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub output: Value,
    pub timestamp: DateTime<Utc>,
}

/// Where the run currently is, and how it got there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    pub current_node: Option<String>,
    #[serde(default)]
    pub execution_path: Vec<String>,
}

/// Flattened, persistable form of an [`ExecutionContext`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    #[serde(default)]
    pub variables: HashMap<String, Variable>,
    #[serde(default)]
    pub node_outputs: HashMap<String, NodeOutput>,
    #[serde(default)]
    pub metadata: ContextMetadata,
}

/// Live variable and node-output store for a single run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the parent workflow.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    variables: HashMap<String, Variable>,
    node_outputs: HashMap<String, NodeOutput>,
    metadata: ContextMetadata,
}

impl ExecutionContext {
    pub fn new(workflow_id: Uuid, execution_id: Uuid) -> Self {
        Self {
            workflow_id,
            execution_id,
            variables: HashMap::new(),
            node_outputs: HashMap::new(),
            metadata: ContextMetadata::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    /// Store a variable.  Last write wins.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        let kind = ValueKind::of(&value);
        self.variables.insert(
            name.into(),
            Variable {
                value,
                kind,
                timestamp: Utc::now(),
            },
        );
    }

    /// Value of `name`, or `default` if it was never set.
    pub fn get_variable(&self, name: &str, default: Value) -> Value {
        self.variables
            .get(name)
            .map(|v| v.value.clone())
            .unwrap_or(default)
    }

    /// The full variable entry (value, type tag, timestamp).
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &HashMap<String, Variable> {
        &self.variables
    }

    /// Plain `name → value` object, as persisted on the execution record.
    pub fn variable_values(&self) -> Value {
        Value::Object(
            self.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect(),
        )
    }

    // -----------------------------------------------------------------------
    // Node outputs
    // -----------------------------------------------------------------------

    pub fn set_node_output(&mut self, node_id: impl Into<String>, output: Value) {
        self.node_outputs.insert(
            node_id.into(),
            NodeOutput {
                output,
                timestamp: Utc::now(),
            },
        );
    }

    pub fn get_node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id).map(|o| &o.output)
    }

    /// Batch form of [`get_node_output`](Self::get_node_output).  Ids with no
    /// recorded output are left out of the result.
    pub fn get_node_outputs<S: AsRef<str>>(&self, node_ids: &[S]) -> HashMap<String, Value> {
        node_ids
            .iter()
            .filter_map(|id| {
                let id = id.as_ref();
                self.get_node_output(id).map(|v| (id.to_owned(), v.clone()))
            })
            .collect()
    }

    /// Plain `node id → output` object, as persisted on the execution record.
    pub fn node_output_values(&self) -> Value {
        Value::Object(
            self.node_outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.output.clone()))
                .collect(),
        )
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Record that `node_id` is about to run.
    pub fn enter_node(&mut self, node_id: &str) {
        self.metadata.current_node = Some(node_id.to_owned());
        self.metadata.execution_path.push(node_id.to_owned());
    }

    pub fn metadata(&self) -> &ContextMetadata {
        &self.metadata
    }

    // -----------------------------------------------------------------------
    // Reference lookup
    // -----------------------------------------------------------------------

    /// Resolve a reference used by condition expressions.
    ///
    /// `node.<id>.<path>` reads a node output; anything else is a variable
    /// name, optionally followed by a dot-path into the variable's value.
    pub fn lookup(&self, reference: &str) -> Option<&Value> {
        if let Some(rest) = reference.strip_prefix("node.") {
            let mut parts = rest.splitn(2, '.');
            let node_id = parts.next()?;
            let output = self.get_node_output(node_id)?;
            return match parts.next() {
                Some(path) => lookup_dotted(output, path),
                None => Some(output),
            };
        }

        if let Some(var) = self.variables.get(reference) {
            return Some(&var.value);
        }

        let mut parts = reference.split('.');
        let head = parts.next()?;
        let var = self.variables.get(head)?;
        lookup_path(&var.value, parts)
    }

    // -----------------------------------------------------------------------
    // Serialisation
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            variables: self.variables.clone(),
            node_outputs: self.node_outputs.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Flatten to a plain JSON record (variables + nodeOutputs + metadata).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    /// Rebuild a context from a snapshot.
    pub fn from_snapshot(workflow_id: Uuid, execution_id: Uuid, snapshot: ContextSnapshot) -> Self {
        Self {
            workflow_id,
            execution_id,
            variables: snapshot.variables,
            node_outputs: snapshot.node_outputs,
            metadata: snapshot.metadata,
        }
    }

    /// Replace this context's state with the one stored in `record`.
    ///
    /// A record that does not deserialise is logged and ignored; the context
    /// keeps its prior state.  Returns whether the restore took effect.
    pub fn restore(&mut self, record: &Value) -> bool {
        match serde_json::from_value::<ContextSnapshot>(record.clone()) {
            Ok(snapshot) => {
                self.variables = snapshot.variables;
                self.node_outputs = snapshot.node_outputs;
                self.metadata = snapshot.metadata;
                true
            }
            Err(e) => {
                warn!(
                    execution_id = %self.execution_id,
                    error = %e,
                    "failed to restore execution context, keeping prior state"
                );
                false
            }
        }
    }
}
