//! Workflow graph definitions.
//!
//! These types are what the JSONB `definition` column of the `workflows`
//! table deserialises into.  They are immutable for the duration of a run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use db::WorkflowRow;

use crate::EngineError;

fn empty_config() -> Value {
    Value::Object(Map::new())
}

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Type tag resolved through the node registry.
    #[serde(rename = "type", alias = "node_type", alias = "nodeType")]
    pub node_type: String,
    /// Arbitrary configuration, interpolated before dispatch.
    #[serde(default = "empty_config")]
    pub config: Value,
    /// `None` falls back to the executor default.
    #[serde(default, alias = "continue_on_error", skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
            continue_on_error: None,
        }
    }

    pub fn continue_on_error(mut self, yes: bool) -> Self {
        self.continue_on_error = Some(yes);
        self
    }
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    /// Branch label, compared against a node's `branch` output under
    /// [`BranchPolicy::MatchBranch`](crate::BranchPolicy::MatchBranch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl EdgeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let (source, target) = (source.into(), target.into());
        Self {
            id: format!("{source}->{target}"),
            source,
            target,
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            nodes,
            edges,
        }
    }

    /// Parse a JSON definition.
    pub fn from_json(definition: Value) -> Result<Self, EngineError> {
        serde_json::from_value(definition).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }

    /// Parse a stored row.  The row's id and name win over the ones embedded
    /// in the definition.
    pub fn from_row(row: &WorkflowRow) -> Result<Self, EngineError> {
        let mut workflow = Self::from_json(row.definition.clone())?;
        workflow.id = row.id;
        if !row.name.is_empty() {
            workflow.name = row.name.clone();
        }
        Ok(workflow)
    }

    pub fn to_row(&self) -> Result<WorkflowRow, EngineError> {
        let definition =
            serde_json::to_value(self).map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;
        Ok(WorkflowRow::new(self.id, self.name.clone(), definition))
    }
}
