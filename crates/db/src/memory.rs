//! In-memory store, used by tests and the `run` command.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ExecutionRecord, ExecutionStatus, NodeExecutionRecord, NodeStatus, WorkflowRow};
use crate::store::{ExecutionStore, WorkflowStore};
use crate::DbError;

#[derive(Debug, Default)]
struct State {
    workflows: HashMap<Uuid, WorkflowRow>,
    executions: HashMap<Uuid, ExecutionRecord>,
    /// Insertion order is creation order.
    node_executions: Vec<NodeExecutionRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, row: &WorkflowRow) -> Result<(), DbError> {
        self.state.write().await.workflows.insert(row.id, row.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowRow, DbError> {
        self.state
            .read()
            .await
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow", id))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRow>, DbError> {
        let mut rows: Vec<WorkflowRow> = self.state.read().await.workflows.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        self.state
            .write()
            .await
            .workflows
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DbError::not_found("workflow", id))
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        self.state
            .write()
            .await
            .executions
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, DbError> {
        self.state
            .read()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("execution", id))
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionRecord, DbError> {
        let mut state = self.state.write().await;
        let record = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("execution", id))?;
        record.transition(status, error)?;
        Ok(record.clone())
    }

    async fn claim_execution(
        &self,
        id: Uuid,
        owner: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>, DbError> {
        let mut state = self.state.write().await;
        let record = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("execution", id))?;
        if record.claim(owner, stale_before).is_err() {
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    async fn heartbeat_execution(&self, id: Uuid, owner: Uuid) -> Result<bool, DbError> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&id) {
            Some(record)
                if record.status == ExecutionStatus::Running && record.claimed_by == Some(owner) =>
            {
                record.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(DbError::not_found("execution", id)),
        }
    }

    async fn save_snapshot(
        &self,
        id: Uuid,
        variables: &Value,
        node_outputs: &Value,
        last_node_id: Option<&str>,
    ) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let record = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("execution", id))?;
        record.variables = variables.clone();
        record.node_outputs = node_outputs.clone();
        if let Some(node_id) = last_node_id {
            record.last_node_id = Some(node_id.to_owned());
        }
        Ok(())
    }

    async fn list_claimable(
        &self,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        // The nil token holds nothing, so only pending and stale runs match.
        let nobody = Uuid::nil();
        let mut pending: Vec<ExecutionRecord> = self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|r| r.is_claimable_by(nobody, stale_before))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn insert_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        if !state.executions.contains_key(&record.execution_id) {
            return Err(DbError::not_found("execution", record.execution_id));
        }
        state.node_executions.push(record.clone());
        Ok(())
    }

    async fn finish_node_execution(
        &self,
        id: Uuid,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<NodeExecutionRecord, DbError> {
        let mut state = self.state.write().await;
        let record = state
            .node_executions
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DbError::not_found("node execution", id))?;
        record.finish(status, output, error)?;
        Ok(record.clone())
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, DbError> {
        Ok(self
            .state
            .read()
            .await
            .node_executions
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn delete_node_executions(&self, execution_id: Uuid) -> Result<u64, DbError> {
        let mut state = self.state.write().await;
        let before = state.node_executions.len();
        state.node_executions.retain(|r| r.execution_id != execution_id);
        Ok((before - state.node_executions.len()) as u64)
    }
}
