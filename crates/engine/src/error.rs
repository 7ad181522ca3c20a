//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Configuration errors ------
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge '{edge_id}' references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        edge_id: String,
        node_id: String,
        side: &'static str,
    },

    #[error("node '{node_id}' has unregistered type '{node_type}'")]
    UnregisteredNodeType { node_id: String, node_type: String },

    /// Every node has an incoming edge.
    #[error("workflow has no start node")]
    NoStartNode,

    #[error("cycle detected at node {0}")]
    CycleDetected(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    /// Lane routing was asked for a node type with no handler.
    #[error("cannot route node type '{0}': no handler registered")]
    UnroutableNodeType(String),

    // ------ Execution errors ------
    /// A node failed without `continueOnError`; the run was halted.
    #[error("node '{node_id}' failed: {message}")]
    NodeFailed { node_id: String, message: String },

    /// Another live worker holds the run, or it already finished.  Nothing
    /// was recorded.
    #[error("execution {execution_id} cannot be claimed while {status}")]
    RunUnavailable {
        execution_id: Uuid,
        status: db::ExecutionStatus,
    },

    // ------ Infrastructure errors ------
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}

impl EngineError {
    /// Problems with the workflow itself, detected before any node runs.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNodeId(_)
                | Self::UnknownNodeReference { .. }
                | Self::UnregisteredNodeType { .. }
                | Self::NoStartNode
                | Self::CycleDetected(_)
                | Self::InvalidDefinition(_)
                | Self::WorkflowNotFound(_)
        )
    }

    /// Failures already recorded on the execution record.  Retrying the run
    /// cannot change their outcome, unlike database or queue errors.
    pub fn is_run_failure(&self) -> bool {
        self.is_config_error() || matches!(self, Self::NodeFailed { .. })
    }
}
