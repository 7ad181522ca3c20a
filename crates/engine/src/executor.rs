//! Workflow execution engine.
//!
//! `GraphExecutor` runs one execution record against its workflow:
//! 1. Validates the graph (fails the record before any node runs).
//! 2. Claims the record and marks it `running`.  A run held by another live
//!    worker is left alone.
//! 3. Walks the graph depth-first from each start node with an explicit
//!    stack, dispatching each node through the `NodeRegistry` and folding
//!    its output into the shared `ExecutionContext`.
//! 4. Persists a node record per visited node and a context snapshot after
//!    each one, then the terminal status.
//!
//! Traversal is sequential: sibling branches run one after another.  While
//! a node runs, the claim's heartbeat is refreshed so other workers can tell
//! a slow run from an abandoned one.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::{DbError, ExecutionRecord, ExecutionStatus, ExecutionStore, NodeExecutionRecord, NodeStatus};
use nodes::{ExecutionContext, NodeRegistry};
use queue::ProgressReporter;

use crate::graph::Graph;
use crate::models::{EdgeSpec, NodeSpec, WorkflowDefinition};
use crate::notifier::{publish_status, Notifier, StatusEvent};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which outgoing edges are followed after a node completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BranchPolicy {
    /// Every outgoing edge, whatever the node produced.
    #[default]
    FollowAll,
    /// An edge carrying a `branch` label is followed only when it equals the
    /// node output's `branch` field.  Unlabelled edges are always followed.
    MatchBranch,
}

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub branch_policy: BranchPolicy,
    /// Applied to nodes that do not set `continueOnError` themselves.
    pub continue_on_error: bool,
    /// How long a claimed run may go without a heartbeat before another
    /// worker may take it over.  Heartbeats go out every third of it.
    pub lease: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            branch_policy: BranchPolicy::default(),
            continue_on_error: false,
            lease: Duration::from_secs(30),
        }
    }
}

/// The worker attempt a run executes under.
#[derive(Debug, Clone)]
pub struct RunClaim {
    /// Claim token.  A retried job presents the same one and may pick its
    /// own run back up.
    pub owner: Uuid,
    pub progress: ProgressReporter,
}

impl RunClaim {
    pub fn new(owner: Uuid) -> Self {
        Self {
            owner,
            progress: ProgressReporter::noop(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }
}

// ---------------------------------------------------------------------------
// Output of a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// Node ids in execution order.
    pub visited: Vec<String>,
    pub error: Option<String>,
}

enum NodeStep {
    Completed(Value),
    Failed(String),
}

// ---------------------------------------------------------------------------
// GraphExecutor
// ---------------------------------------------------------------------------

pub struct GraphExecutor {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn Notifier>,
    config: ExecutorConfig,
}

impl GraphExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn ExecutionStore>,
        notifier: Arc<dyn Notifier>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            notifier,
            config,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Heartbeats older than this mark a run as abandoned.
    pub fn stale_before(&self) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Utc::now() - lease
    }

    /// Run the execution record `ctx.execution_id` to a terminal status.
    ///
    /// # Errors
    /// Configuration errors and halting node failures are returned *after*
    /// the record has been marked `failed`; see
    /// [`EngineError::is_run_failure`].  [`EngineError::RunUnavailable`]
    /// when another live worker holds the run.  Store errors are returned
    /// as-is.
    #[instrument(
        skip(self, workflow, ctx, claim),
        fields(workflow_id = %workflow.id, execution_id = %ctx.execution_id, owner = %claim.owner)
    )]
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        mut ctx: ExecutionContext,
        claim: &RunClaim,
    ) -> Result<RunOutcome, EngineError> {
        let execution_id = ctx.execution_id;
        let record = self.store.get_execution(execution_id).await?;

        let graph = match Graph::validate(workflow, &self.registry) {
            Ok(graph) => graph,
            Err(e) if record.is_claimable_by(claim.owner, self.stale_before()) => {
                error!(error = %e, "workflow failed validation");
                self.fail_run(&record, &ctx, e.to_string()).await?;
                return Err(e);
            }
            Err(_) => {
                return Err(EngineError::RunUnavailable {
                    execution_id,
                    status: record.status,
                })
            }
        };

        if !self.start_run(&record, claim.owner).await? {
            return Ok(self.cancelled(execution_id, Vec::new()));
        }
        info!(nodes = workflow.nodes.len(), "run started");

        let total = workflow.nodes.len();
        let mut visited: HashSet<&str> = HashSet::with_capacity(total);
        let mut order: Vec<String> = Vec::with_capacity(total);
        let mut stack: Vec<&NodeSpec> = graph.start_nodes().rev().collect();

        while let Some(node) = stack.pop() {
            if !visited.insert(node.id.as_str()) {
                continue;
            }
            if self.cancel_requested(execution_id, claim.owner).await? {
                info!(node_id = %node.id, "run cancelled, stopping before node");
                self.save_snapshot(&ctx, order.last().map(String::as_str)).await?;
                return Ok(self.cancelled(execution_id, order));
            }

            let step = self.run_node(node, &mut ctx, claim.owner).await?;
            order.push(node.id.clone());
            self.save_snapshot(&ctx, Some(&node.id)).await?;
            claim.progress.report(json!({
                "node_id": node.id,
                "completed": order.len(),
                "total": total,
            }));

            let output = match step {
                NodeStep::Completed(output) => output,
                NodeStep::Failed(message) if self.continues_on_error(node) => {
                    warn!(node_id = %node.id, error = %message, "node failed, continuing");
                    json!({ "error": message })
                }
                NodeStep::Failed(message) => {
                    let err = EngineError::NodeFailed {
                        node_id: node.id.clone(),
                        message,
                    };
                    error!(node_id = %node.id, error = %err, "node failed, halting run");
                    self.fail_run(&record, &ctx, err.to_string()).await?;
                    return Err(err);
                }
            };

            let next = graph
                .outgoing(&node.id)
                .iter()
                .filter(|edge| self.follows(edge, &output))
                .filter_map(|edge| graph.node(&edge.target))
                .filter(|n| !visited.contains(n.id.as_str()));
            let before = stack.len();
            stack.extend(next);
            stack[before..].reverse();
        }

        if self.cancel_requested(execution_id, claim.owner).await? {
            return Ok(self.cancelled(execution_id, order));
        }

        let finished = self
            .store
            .transition_execution(execution_id, ExecutionStatus::Completed, None)
            .await;
        if let Err(e) = finished {
            let cancelled = matches!(e, DbError::InvalidTransition { .. })
                && self.is_cancelled(execution_id).await?;
            if cancelled {
                info!("run cancelled while finishing");
                return Ok(self.cancelled(execution_id, order));
            }
            return Err(e.into());
        }
        self.publish_run(&record, ExecutionStatus::Completed);
        info!(visited = order.len(), "run completed");

        Ok(RunOutcome {
            execution_id,
            status: ExecutionStatus::Completed,
            visited: order,
            error: None,
        })
    }

    /// Mark a run `failed` with `message`, keeping the context snapshot.
    /// A run that already reached a terminal status is left alone.
    pub async fn fail_run(
        &self,
        record: &ExecutionRecord,
        ctx: &ExecutionContext,
        message: String,
    ) -> Result<(), EngineError> {
        self.save_snapshot(ctx, ctx.metadata().current_node.as_deref())
            .await?;
        match self
            .store
            .transition_execution(record.id, ExecutionStatus::Failed, Some(message))
            .await
        {
            Ok(_) => {
                self.publish_run(record, ExecutionStatus::Failed);
                Ok(())
            }
            Err(DbError::InvalidTransition { from, .. }) => {
                warn!(execution_id = %record.id, status = %from, "run already finished, not marking failed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Claim the record for `owner` and mark it `running`.  Node records
    /// left by an earlier holder are dropped, so a taken-over run restarts
    /// from scratch.  Returns `false` if the run was cancelled.
    async fn start_run(&self, record: &ExecutionRecord, owner: Uuid) -> Result<bool, EngineError> {
        let claimed = self
            .store
            .claim_execution(record.id, owner, self.stale_before())
            .await?;
        if claimed.is_none() {
            let current = self.store.get_execution(record.id).await?;
            if current.status == ExecutionStatus::Cancelled {
                return Ok(false);
            }
            info!(status = %current.status, holder = ?current.claimed_by, "run is not ours to start");
            return Err(EngineError::RunUnavailable {
                execution_id: record.id,
                status: current.status,
            });
        }

        let dropped = self.store.delete_node_executions(record.id).await?;
        if dropped > 0 {
            warn!(dropped, "restarting a run abandoned by an earlier attempt");
        }
        self.publish_run(record, ExecutionStatus::Running);
        Ok(true)
    }

    /// Dispatch one node and record the result.  The config is interpolated
    /// once; the node record holds exactly what the handler received.
    #[instrument(skip(self, node, ctx, owner), fields(node_id = %node.id, node_type = %node.node_type))]
    async fn run_node(
        &self,
        node: &NodeSpec,
        ctx: &mut ExecutionContext,
        owner: Uuid,
    ) -> Result<NodeStep, EngineError> {
        ctx.enter_node(&node.id);
        let input = ctx.resolve_value(&node.config);
        let record = NodeExecutionRecord::start(ctx.execution_id, &node.id, &node.node_type, input);
        self.store.insert_node_execution(&record).await?;
        self.publish_node(ctx, &node.id, NodeStatus::Running);

        let dispatched = self
            .registry
            .dispatch_resolved(&node.node_type, &record.input, ctx);
        let result = self.heartbeat_while(ctx.execution_id, owner, dispatched).await;
        match result {
            Ok(result) => {
                if !result.success {
                    warn!(error = ?result.error, "node reported a failure");
                }
                let output = result.into_output();
                ctx.set_node_output(&node.id, output.clone());
                self.store
                    .finish_node_execution(record.id, NodeStatus::Completed, Some(output.clone()), None)
                    .await?;
                self.publish_node(ctx, &node.id, NodeStatus::Completed);
                debug!("node completed");
                Ok(NodeStep::Completed(output))
            }
            Err(e) => {
                let message = e.to_string();
                let output = self.continues_on_error(node).then(|| {
                    let output = json!({ "error": message });
                    ctx.set_node_output(&node.id, output.clone());
                    output
                });
                self.store
                    .finish_node_execution(record.id, NodeStatus::Failed, output, Some(message.clone()))
                    .await?;
                self.publish_node(ctx, &node.id, NodeStatus::Failed);
                Ok(NodeStep::Failed(message))
            }
        }
    }

    fn continues_on_error(&self, node: &NodeSpec) -> bool {
        node.continue_on_error.unwrap_or(self.config.continue_on_error)
    }

    fn follows(&self, edge: &EdgeSpec, output: &Value) -> bool {
        match self.config.branch_policy {
            BranchPolicy::FollowAll => true,
            BranchPolicy::MatchBranch => {
                match (edge.branch.as_deref(), output.get("branch").and_then(Value::as_str)) {
                    (Some(label), Some(branch)) => label == branch,
                    _ => true,
                }
            }
        }
    }

    /// Drive `work` to completion, refreshing the run's heartbeat meanwhile.
    async fn heartbeat_while<F: Future>(&self, execution_id: Uuid, owner: Uuid, work: F) -> F::Output {
        tokio::pin!(work);
        let period = (self.config.lease / 3).max(Duration::from_millis(10));
        let mut beat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = beat.tick() => match self.store.heartbeat_execution(execution_id, owner).await {
                    Ok(true) => debug!("heartbeat"),
                    Ok(false) => warn!("run claim lost while a node was running"),
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                },
            }
        }
    }

    /// Checked at every node boundary: `true` once the run is cancelled.
    ///
    /// # Errors
    /// [`EngineError::RunUnavailable`] when the claim has passed to another
    /// worker or the run was finished by someone else.
    async fn cancel_requested(&self, execution_id: Uuid, owner: Uuid) -> Result<bool, EngineError> {
        let record = self.store.get_execution(execution_id).await?;
        match record.status {
            ExecutionStatus::Cancelled => Ok(true),
            ExecutionStatus::Running if record.claimed_by == Some(owner) => Ok(false),
            status => {
                warn!(%status, holder = ?record.claimed_by, "run claim lost, stopping");
                Err(EngineError::RunUnavailable { execution_id, status })
            }
        }
    }

    async fn is_cancelled(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let record = self.store.get_execution(execution_id).await?;
        Ok(record.status == ExecutionStatus::Cancelled)
    }

    async fn save_snapshot(
        &self,
        ctx: &ExecutionContext,
        last_node_id: Option<&str>,
    ) -> Result<(), EngineError> {
        self.store
            .save_snapshot(
                ctx.execution_id,
                &ctx.variable_values(),
                &ctx.node_output_values(),
                last_node_id,
            )
            .await?;
        Ok(())
    }

    fn cancelled(&self, execution_id: Uuid, visited: Vec<String>) -> RunOutcome {
        RunOutcome {
            execution_id,
            status: ExecutionStatus::Cancelled,
            visited,
            error: None,
        }
    }

    fn publish_run(&self, record: &ExecutionRecord, status: ExecutionStatus) {
        publish_status(
            self.notifier.as_ref(),
            StatusEvent::run(record.id, record.workflow_id, status),
        );
    }

    fn publish_node(&self, ctx: &ExecutionContext, node_id: &str, status: NodeStatus) {
        publish_status(
            self.notifier.as_ref(),
            StatusEvent::node(ctx.execution_id, ctx.workflow_id, node_id, status),
        );
    }
}

impl std::fmt::Debug for GraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
