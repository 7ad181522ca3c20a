//! Persistence records and their status machines.
//!
//! These are the audit rows of a run.  Graph types live in the `engine`
//! crate; a workflow is stored here as an opaque JSON definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::FromRow;
use uuid::Uuid;

use crate::DbError;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Full JSON workflow definition (nodes, edges).
    pub definition: Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRow {
    pub fn new(id: Uuid, name: impl Into<String>, definition: Value) -> Self {
        Self {
            id,
            name: name.into(),
            definition,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States from which `self` may be entered.
    pub fn sources(self) -> &'static [ExecutionStatus] {
        use ExecutionStatus::*;
        match self {
            Pending => &[],
            Running => &[Pending],
            Completed => &[Running],
            Failed | Cancelled => &[Pending, Running],
        }
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        next.sources().contains(&self)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = DbError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DbError::Decode(format!("unknown execution status: {other}"))),
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    /// Seed variables the run was requested with.
    pub input: Value,
    /// Final variable snapshot.
    pub variables: Value,
    /// Final node-output snapshot.
    pub node_outputs: Value,
    pub error: Option<String>,
    /// Last node the executor reached.
    pub last_node_id: Option<String>,
    /// Worker token holding the run while it is `running`.
    pub claimed_by: Option<Uuid>,
    /// Last sign of life from the claim holder.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A new `pending` record.
    pub fn new(workflow_id: Uuid, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Pending,
            input,
            variables: json!({}),
            node_outputs: json!({}),
            error: None,
            last_node_id: None,
            claimed_by: None,
            heartbeat_at: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    /// Move to `next`, stamping timestamps.  `error` is kept when given.
    pub fn transition(&mut self, next: ExecutionStatus, error: Option<String>) -> Result<(), DbError> {
        if !self.status.can_transition_to(next) {
            return Err(DbError::invalid_transition(self.status, next));
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        if error.is_some() {
            self.error = error;
        }
        self.status = next;
        Ok(())
    }

    /// Whether `owner` may take the run: it is `pending`, or `running` under
    /// `owner` already, or `running` under a holder silent since `stale_before`.
    pub fn is_claimable_by(&self, owner: Uuid, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            ExecutionStatus::Pending => true,
            ExecutionStatus::Running => {
                self.claimed_by == Some(owner)
                    || self.heartbeat_at.map_or(true, |beat| beat < stale_before)
            }
            _ => false,
        }
    }

    /// Take the run for `owner` and mark it `running`.
    pub fn claim(&mut self, owner: Uuid, stale_before: DateTime<Utc>) -> Result<(), DbError> {
        if !self.is_claimable_by(owner, stale_before) {
            return Err(DbError::invalid_transition(self.status, ExecutionStatus::Running));
        }
        let now = Utc::now();
        self.status = ExecutionStatus::Running;
        self.claimed_by = Some(owner);
        self.heartbeat_at = Some(now);
        self.started_at = Some(now);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = DbError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DbError::Decode(format!("unknown node status: {other}"))),
        }
    }
}

/// One visited node of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    /// Interpolated config the handler received.
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRecord {
    /// A new `running` record.
    pub fn start(
        execution_id: Uuid,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Running,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Close a `running` record as `completed` or `failed`.
    pub fn finish(
        &mut self,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<(), DbError> {
        if self.status != NodeStatus::Running || status == NodeStatus::Running {
            return Err(DbError::invalid_transition(self.status, status));
        }
        self.status = status;
        self.output = output;
        self.error = error;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
