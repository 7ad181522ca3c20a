//! Storage seams consumed by the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ExecutionRecord, ExecutionStatus, NodeExecutionRecord, NodeStatus, WorkflowRow};
use crate::DbError;

/// Where workflow definitions live.  Read-only for the duration of a run.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace a workflow row.
    async fn save_workflow(&self, row: &WorkflowRow) -> Result<(), DbError>;

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError>;

    /// All workflows, newest first.
    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError>;

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError>;
}

/// Execution and node-execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), DbError>;

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, DbError>;

    /// Atomically move a run to `status`.
    ///
    /// # Errors
    /// [`DbError::InvalidTransition`] when the current status does not allow it.
    async fn transition_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionRecord, DbError>;

    /// Atomically take a run for `owner` and mark it `running`; see
    /// [`ExecutionRecord::is_claimable_by`].  `None` when someone else holds
    /// it or it has already finished.
    async fn claim_execution(
        &self,
        id: Uuid,
        owner: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>, DbError>;

    /// Refresh the heartbeat of a run `owner` still holds.  Returns `false`
    /// once the claim is gone.
    async fn heartbeat_execution(&self, id: Uuid, owner: Uuid) -> Result<bool, DbError>;

    /// Persist the context snapshot and the last reached node.
    async fn save_snapshot(
        &self,
        id: Uuid,
        variables: &Value,
        node_outputs: &Value,
        last_node_id: Option<&str>,
    ) -> Result<(), DbError>;

    /// Runs a worker may pick up, oldest first: `pending` ones and `running`
    /// ones whose holder has not heartbeated since `stale_before`.
    async fn list_claimable(
        &self,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, DbError>;

    async fn insert_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), DbError>;

    /// Close a `running` node record.
    async fn finish_node_execution(
        &self,
        id: Uuid,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<NodeExecutionRecord, DbError>;

    /// Node records of a run, in creation order.
    async fn list_node_executions(&self, execution_id: Uuid)
        -> Result<Vec<NodeExecutionRecord>, DbError>;

    /// Drop the node records of a run being restarted.
    async fn delete_node_executions(&self, execution_id: Uuid) -> Result<u64, DbError>;
}
