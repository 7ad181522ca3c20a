//! Postgres-backed store delegating to the repository functions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ExecutionRecord, ExecutionStatus, NodeExecutionRecord, NodeStatus, WorkflowRow};
use crate::repository::{executions, workflows};
use crate::store::{ExecutionStore, WorkflowStore};
use crate::{DbError, DbPool};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn save_workflow(&self, row: &WorkflowRow) -> Result<(), DbError> {
        workflows::upsert_workflow(&self.pool, row).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        workflows::get_workflow(&self.pool, id).await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError> {
        workflows::list_workflows(&self.pool).await
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        workflows::delete_workflow(&self.pool, id).await
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        executions::insert_execution(&self.pool, record).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, DbError> {
        executions::get_execution(&self.pool, id).await
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionRecord, DbError> {
        executions::transition_execution(&self.pool, id, status, error).await
    }

    async fn claim_execution(
        &self,
        id: Uuid,
        owner: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>, DbError> {
        executions::claim_execution(&self.pool, id, owner, stale_before).await
    }

    async fn heartbeat_execution(&self, id: Uuid, owner: Uuid) -> Result<bool, DbError> {
        executions::heartbeat_execution(&self.pool, id, owner).await
    }

    async fn save_snapshot(
        &self,
        id: Uuid,
        variables: &Value,
        node_outputs: &Value,
        last_node_id: Option<&str>,
    ) -> Result<(), DbError> {
        executions::save_snapshot(&self.pool, id, variables, node_outputs, last_node_id).await
    }

    async fn list_claimable(
        &self,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        executions::list_claimable(&self.pool, limit, stale_before).await
    }

    async fn insert_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), DbError> {
        executions::insert_node_execution(&self.pool, record).await
    }

    async fn finish_node_execution(
        &self,
        id: Uuid,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<NodeExecutionRecord, DbError> {
        executions::finish_node_execution(&self.pool, id, status, output, error).await
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, DbError> {
        executions::list_node_executions(&self.pool, execution_id).await
    }

    async fn delete_node_executions(&self, execution_id: Uuid) -> Result<u64, DbError> {
        executions::delete_node_executions(&self.pool, execution_id).await
    }
}
