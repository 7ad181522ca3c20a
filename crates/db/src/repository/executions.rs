//! Execution and node-execution repository functions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{
    models::{ExecutionRecord, ExecutionStatus, NodeExecutionRecord, NodeStatus},
    DbError,
};

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, input, variables, node_outputs, error, \
     last_node_id, claimed_by, heartbeat_at, started_at, finished_at, created_at";

const NODE_COLUMNS: &str =
    "id, execution_id, node_id, node_type, status, input, output, error, started_at, finished_at";

/// Raw `executions` row; status is stored as text.
#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    status: String,
    input: Value,
    variables: Value,
    node_outputs: Value,
    error: Option<String>,
    last_node_id: Option<String>,
    claimed_by: Option<Uuid>,
    heartbeat_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = DbError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            status: row.status.parse()?,
            input: row.input,
            variables: row.variables,
            node_outputs: row.node_outputs,
            error: row.error,
            last_node_id: row.last_node_id,
            claimed_by: row.claimed_by,
            heartbeat_at: row.heartbeat_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct NodeExecutionRow {
    id: Uuid,
    execution_id: Uuid,
    node_id: String,
    node_type: String,
    status: String,
    input: Value,
    output: Option<Value>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<NodeExecutionRow> for NodeExecutionRecord {
    type Error = DbError;

    fn try_from(row: NodeExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            execution_id: row.execution_id,
            node_id: row.node_id,
            node_type: row.node_type,
            status: row.status.parse()?,
            input: row.input,
            output: row.output,
            error: row.error,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

pub async fn insert_execution(pool: &PgPool, record: &ExecutionRecord) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO executions
            (id, workflow_id, status, input, variables, node_outputs, error,
             last_node_id, claimed_by, heartbeat_at, started_at, finished_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(record.id)
    .bind(record.workflow_id)
    .bind(record.status.as_str())
    .bind(&record.input)
    .bind(&record.variables)
    .bind(&record.node_outputs)
    .bind(&record.error)
    .bind(&record.last_node_id)
    .bind(record.claimed_by)
    .bind(record.heartbeat_at)
    .bind(record.started_at)
    .bind(record.finished_at)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRecord, DbError> {
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1");
    sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DbError::not_found("execution", id))?
        .try_into()
}

/// Move an execution to `status` if its current status allows it.
///
/// The guard lives in the `WHERE` clause so concurrent writers cannot both
/// win a transition.
pub async fn transition_execution(
    pool: &PgPool,
    id: Uuid,
    status: ExecutionStatus,
    error: Option<String>,
) -> Result<ExecutionRecord, DbError> {
    let sources: Vec<&str> = status.sources().iter().map(|s| s.as_str()).collect();
    let sql = format!(
        r#"
        UPDATE executions
        SET status      = $2,
            error       = COALESCE($3, error),
            started_at  = CASE WHEN $2 = 'running' THEN now() ELSE started_at END,
            finished_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN now()
                               ELSE finished_at END
        WHERE id = $1 AND status = ANY($4)
        RETURNING {EXECUTION_COLUMNS}
        "#
    );

    let updated = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(&sources)
        .fetch_optional(pool)
        .await?;

    match updated {
        Some(row) => row.try_into(),
        None => {
            let current = get_execution(pool, id).await?;
            Err(DbError::invalid_transition(current.status, status))
        }
    }
}

/// Take a run for `owner`.
///
/// One `UPDATE` both checks and takes the claim, so two workers polling the
/// same row cannot both win it.  A `running` row is only taken when `owner`
/// already holds it or its holder stopped heartbeating before `stale_before`.
pub async fn claim_execution(
    pool: &PgPool,
    id: Uuid,
    owner: Uuid,
    stale_before: DateTime<Utc>,
) -> Result<Option<ExecutionRecord>, DbError> {
    let sql = format!(
        r#"
        UPDATE executions
        SET status       = 'running',
            claimed_by   = $2,
            heartbeat_at = now(),
            started_at   = now()
        WHERE id = $1
          AND (status = 'pending'
               OR (status = 'running'
                   AND (claimed_by = $2 OR heartbeat_at IS NULL OR heartbeat_at < $3)))
        RETURNING {EXECUTION_COLUMNS}
        "#
    );
    let claimed = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(id)
        .bind(owner)
        .bind(stale_before)
        .fetch_optional(pool)
        .await?;

    match claimed {
        Some(row) => Ok(Some(row.try_into()?)),
        None => {
            // Distinguish "held elsewhere" from "no such run".
            get_execution(pool, id).await?;
            Ok(None)
        }
    }
}

pub async fn heartbeat_execution(pool: &PgPool, id: Uuid, owner: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET heartbeat_at = now()
        WHERE id = $1 AND status = 'running' AND claimed_by = $2
        "#,
    )
    .bind(id)
    .bind(owner)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        get_execution(pool, id).await?;
        return Ok(false);
    }
    Ok(true)
}

pub async fn save_snapshot(
    pool: &PgPool,
    id: Uuid,
    variables: &Value,
    node_outputs: &Value,
    last_node_id: Option<&str>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET variables = $2, node_outputs = $3, last_node_id = COALESCE($4, last_node_id)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(variables)
    .bind(node_outputs)
    .bind(last_node_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("execution", id));
    }
    Ok(())
}

/// Pending executions and abandoned running ones, oldest first.
pub async fn list_claimable(
    pool: &PgPool,
    limit: u32,
    stale_before: DateTime<Utc>,
) -> Result<Vec<ExecutionRecord>, DbError> {
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions \
         WHERE status = 'pending' \
            OR (status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < $2)) \
         ORDER BY created_at ASC LIMIT $1"
    );
    sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(i64::from(limit))
        .bind(stale_before)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(ExecutionRecord::try_from)
        .collect()
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

pub async fn insert_node_execution(
    pool: &PgPool,
    record: &NodeExecutionRecord,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO node_executions
            (id, execution_id, node_id, node_type, status, input, output, error, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(record.id)
    .bind(record.execution_id)
    .bind(&record.node_id)
    .bind(&record.node_type)
    .bind(record.status.as_str())
    .bind(&record.input)
    .bind(&record.output)
    .bind(&record.error)
    .bind(record.started_at)
    .bind(record.finished_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Close a `running` node execution.
pub async fn finish_node_execution(
    pool: &PgPool,
    id: Uuid,
    status: NodeStatus,
    output: Option<Value>,
    error: Option<String>,
) -> Result<NodeExecutionRecord, DbError> {
    if status == NodeStatus::Running {
        return Err(DbError::invalid_transition(NodeStatus::Running, status));
    }

    let sql = format!(
        r#"
        UPDATE node_executions
        SET status = $2, output = $3, error = $4, finished_at = now()
        WHERE id = $1 AND status = 'running'
        RETURNING {NODE_COLUMNS}
        "#
    );
    let updated = sqlx::query_as::<_, NodeExecutionRow>(&sql)
        .bind(id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .fetch_optional(pool)
        .await?;

    match updated {
        Some(row) => row.try_into(),
        None => {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM node_executions WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?;
            match current {
                Some(from) => Err(DbError::invalid_transition(from, status)),
                None => Err(DbError::not_found("node execution", id)),
            }
        }
    }
}

/// Node executions of a run in creation order.
pub async fn list_node_executions(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Vec<NodeExecutionRecord>, DbError> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM node_executions WHERE execution_id = $1 ORDER BY seq ASC"
    );
    sqlx::query_as::<_, NodeExecutionRow>(&sql)
        .bind(execution_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(NodeExecutionRecord::try_from)
        .collect()
}

pub async fn delete_node_executions(pool: &PgPool, execution_id: Uuid) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM node_executions WHERE execution_id = $1")
        .bind(execution_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
