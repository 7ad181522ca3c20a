//! Run orchestration: submit a run, queue it, execute it on a worker.
//!
//! A run request becomes a `pending` [`ExecutionRecord`] plus a job on the
//! `workflow-execution` lane.  The lane's handler loads the workflow, seeds
//! an [`ExecutionContext`] and hands both to the [`GraphExecutor`], which
//! claims the record under the job's id.  A background task watches the
//! queue's events and marks records `failed` once their job has spent every
//! attempt.
//!
//! Several workers may poll the same store.  Claims keep them off each
//! other's live runs; a run whose worker died stops heartbeating and is
//! picked up again once its lease runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::{DbError, ExecutionRecord, ExecutionStatus, ExecutionStore, NodeExecutionRecord, WorkflowStore};
use nodes::ExecutionContext;
use queue::config::WORKFLOW_EXECUTION;
use queue::{JobContext, JobEvent, JobEventKind, JobHandle, JobHandler, JobOptions, JobPriority, JobQueue, QueueError};

use crate::executor::{GraphExecutor, RunClaim};
use crate::models::WorkflowDefinition;
use crate::notifier::{publish_status, Notifier, StatusEvent};
use crate::EngineError;

/// Options for [`Runtime::submit_run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Seed variables, each stored under its own name.
    pub variables: Map<String, Value>,
    pub priority: JobPriority,
}

/// A run that has been recorded and queued.
#[derive(Debug, Clone)]
pub struct SubmittedRun {
    pub execution_id: Uuid,
    pub job: JobHandle,
}

/// A run record together with its node records.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution: ExecutionRecord,
    pub nodes: Vec<NodeExecutionRecord>,
}

/// Payload of a `workflow-execution` job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RunPayload {
    workflow_id: Uuid,
    execution_id: Uuid,
}

/// Build the context a run starts from.
///
/// `input` is the record's stored input: `trigger` becomes the `trigger`
/// variable (`{}` when absent) and each key of `variables` is stored
/// individually.
pub fn seed_context(workflow_id: Uuid, execution_id: Uuid, input: &Value) -> ExecutionContext {
    let mut ctx = ExecutionContext::new(workflow_id, execution_id);
    if let Some(vars) = input.get("variables").and_then(Value::as_object) {
        for (name, value) in vars {
            ctx.set_variable(name.clone(), value.clone());
        }
    }
    let trigger = input.get("trigger").cloned().unwrap_or_else(|| json!({}));
    ctx.set_variable("trigger", trigger);
    ctx
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    queue: JobQueue,
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    executor: Arc<GraphExecutor>,
    notifier: Arc<dyn Notifier>,
}

impl Runtime {
    pub fn new(
        queue: JobQueue,
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        executor: Arc<GraphExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            queue,
            workflows,
            executions,
            executor,
            notifier,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Attach the run handler to the `workflow-execution` lane and spawn the
    /// task that reconciles exhausted jobs with their records.
    ///
    /// Must be called from within a tokio runtime, once.
    pub fn start(&self) -> Result<JoinHandle<()>, EngineError> {
        let events = self.queue.subscribe();
        let handler = RunJobHandler {
            workflows: self.workflows.clone(),
            executions: self.executions.clone(),
            executor: self.executor.clone(),
        };
        self.queue.process(WORKFLOW_EXECUTION, Arc::new(handler))?;

        Ok(tokio::spawn(watch_run_jobs(
            events,
            self.executions.clone(),
            self.notifier.clone(),
        )))
    }

    /// Record a `pending` run of `workflow_id` and queue it.
    ///
    /// # Errors
    /// [`EngineError::WorkflowNotFound`] if no such workflow is stored.
    #[instrument(skip(self, trigger, options), fields(priority = ?options.priority))]
    pub async fn submit_run(
        &self,
        workflow_id: Uuid,
        trigger: Value,
        options: RunOptions,
    ) -> Result<SubmittedRun, EngineError> {
        match self.workflows.get_workflow(workflow_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Err(EngineError::WorkflowNotFound(workflow_id)),
            Err(e) => return Err(e.into()),
        }

        let input = json!({ "trigger": trigger, "variables": options.variables });
        let record = ExecutionRecord::new(workflow_id, input);
        self.executions.create_execution(&record).await?;
        publish_status(
            self.notifier.as_ref(),
            StatusEvent::run(record.id, workflow_id, ExecutionStatus::Pending),
        );

        let job = self.enqueue_run(&record, options.priority)?;
        info!(execution_id = %record.id, job_id = %job.id(), "run submitted");
        Ok(SubmittedRun {
            execution_id: record.id,
            job,
        })
    }

    /// Queue an existing record.  Queuing the same record twice returns the
    /// job already in flight.
    pub fn enqueue_run(
        &self,
        record: &ExecutionRecord,
        priority: JobPriority,
    ) -> Result<JobHandle, EngineError> {
        let payload = RunPayload {
            workflow_id: record.workflow_id,
            execution_id: record.id,
        };
        let options = JobOptions::default()
            .with_priority(priority)
            .with_dedup_key(record.id.to_string());
        let job = self.queue.add(WORKFLOW_EXECUTION, json!(payload), options)?;
        Ok(job)
    }

    /// Queue up to `limit` claimable records, oldest first: `pending` ones
    /// and `running` ones abandoned by a worker that stopped heartbeating.
    /// Returns how many were handed to the queue.
    pub async fn poll_pending(&self, limit: u32) -> Result<usize, EngineError> {
        let claimable = self
            .executions
            .list_claimable(limit, self.executor.stale_before())
            .await?;
        for record in &claimable {
            if record.status == ExecutionStatus::Running {
                warn!(execution_id = %record.id, holder = ?record.claimed_by, "reclaiming an abandoned run");
            }
            self.enqueue_run(record, JobPriority::Normal)?;
        }
        if !claimable.is_empty() {
            debug!(count = claimable.len(), "queued claimable runs");
        }
        Ok(claimable.len())
    }

    /// Stop taking new runs and wait up to `grace` for the ones in flight.
    /// Returns `false` if some were still running; their records stay
    /// `running` and another worker reclaims them once the lease runs out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.queue.shutdown();
        let drained = self.queue.drain(grace).await;
        if drained {
            info!("in-flight runs finished");
        } else {
            warn!("shutting down with runs still in flight");
        }
        drained
    }

    /// Request cancellation.  The executor stops at the next node boundary;
    /// a run that has not started yet never will.
    ///
    /// # Errors
    /// [`DbError::InvalidTransition`] (wrapped) if the run already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<ExecutionRecord, EngineError> {
        let record = self
            .executions
            .transition_execution(execution_id, ExecutionStatus::Cancelled, None)
            .await?;
        publish_status(
            self.notifier.as_ref(),
            StatusEvent::run(record.id, record.workflow_id, ExecutionStatus::Cancelled),
        );
        info!("run cancelled");
        Ok(record)
    }

    pub async fn report(&self, execution_id: Uuid) -> Result<RunReport, EngineError> {
        let execution = self.executions.get_execution(execution_id).await?;
        let nodes = self.executions.list_node_executions(execution_id).await?;
        Ok(RunReport { execution, nodes })
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// Handles `workflow-execution` jobs.
struct RunJobHandler {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    executor: Arc<GraphExecutor>,
}

impl RunJobHandler {
    async fn load_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        let row = match self.workflows.get_workflow(workflow_id).await {
            Ok(row) => row,
            Err(e) if e.is_not_found() => return Err(EngineError::WorkflowNotFound(workflow_id)),
            Err(e) => return Err(e.into()),
        };
        WorkflowDefinition::from_row(&row)
    }

    async fn run(&self, payload: RunPayload, job: &JobContext) -> Result<Value, EngineError> {
        let record = self.executions.get_execution(payload.execution_id).await?;
        if record.status.is_terminal() {
            info!(status = %record.status, "run already finished, skipping");
            return Ok(json!({
                "execution_id": record.id,
                "status": record.status,
                "skipped": true,
            }));
        }

        let ctx = seed_context(record.workflow_id, record.id, &record.input);
        let workflow = match self.load_workflow(record.workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) if e.is_run_failure() => {
                error!(error = %e, "cannot load workflow");
                self.executor.fail_run(&record, &ctx, e.to_string()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let claim = RunClaim::new(job.id).with_progress(job.progress.clone());
        let outcome = self.executor.execute(&workflow, ctx, &claim).await?;
        Ok(json!(outcome))
    }
}

#[async_trait]
impl JobHandler for RunJobHandler {
    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt))]
    async fn handle(&self, job: JobContext) -> queue::Result<Value> {
        let payload: RunPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| QueueError::handler(format!("malformed run payload: {e}")))?;

        match self.run(payload, &job).await {
            Ok(result) => Ok(result),
            // Already recorded on the execution record; another attempt
            // would fail the same way.
            Err(e) if e.is_run_failure() => Ok(json!({
                "execution_id": payload.execution_id,
                "status": ExecutionStatus::Failed,
                "error": e.to_string(),
            })),
            // Another worker has it; this job has nothing to do.
            Err(EngineError::RunUnavailable { execution_id, status }) => Ok(json!({
                "execution_id": execution_id,
                "status": status,
                "skipped": true,
            })),
            Err(e) => {
                warn!(error = %e, last_attempt = job.is_last_attempt(), "run attempt failed");
                Err(QueueError::handler(e.to_string()))
            }
        }
    }
}

/// Mark records `failed` when their run job is out of attempts.
async fn watch_run_jobs(
    mut events: tokio::sync::broadcast::Receiver<JobEvent>,
    executions: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn Notifier>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "run job watcher lagged behind queue events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.queue != WORKFLOW_EXECUTION {
            continue;
        }

        match event.kind {
            JobEventKind::Failed {
                error,
                will_retry: false,
                payload,
            } => {
                let Ok(payload) = serde_json::from_value::<RunPayload>(payload) else {
                    warn!(job_id = %event.job_id, "failed run job has a malformed payload");
                    continue;
                };
                let message = format!("run job failed: {error}");
                match executions
                    .transition_execution(payload.execution_id, ExecutionStatus::Failed, Some(message))
                    .await
                {
                    Ok(record) => {
                        warn!(execution_id = %record.id, "run failed after exhausting its attempts");
                        publish_status(
                            notifier.as_ref(),
                            StatusEvent::run(record.id, record.workflow_id, ExecutionStatus::Failed),
                        );
                    }
                    Err(DbError::InvalidTransition { .. }) => {}
                    Err(e) => {
                        error!(execution_id = %payload.execution_id, error = %e, "could not mark run failed");
                    }
                }
            }
            JobEventKind::Progress(progress) => {
                debug!(job_id = %event.job_id, %progress, "run progress");
            }
            _ => {}
        }
    }
}
