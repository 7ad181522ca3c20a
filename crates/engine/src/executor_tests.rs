//! Tests for the graph executor.
//!
//! Every test runs against `MemoryStore` with `MockNode` handlers, so no
//! Postgres connection is required.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use db::{
    DbError, ExecutionRecord, ExecutionStatus, ExecutionStore, MemoryStore, NodeExecutionRecord,
    NodeStatus,
};
use nodes::mock::MockNode;
use nodes::{ExecutionContext, NodeError, NodeHandler, NodeRegistry, NodeResult};
use queue::ProgressReporter;

use crate::executor::{BranchPolicy, ExecutorConfig, GraphExecutor, RunClaim};
use crate::models::{EdgeSpec, NodeSpec, WorkflowDefinition};
use crate::notifier::{BroadcastNotifier, Notifier};
use crate::runtime::seed_context;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryStore>,
    notifier: Arc<BroadcastNotifier>,
    executor: GraphExecutor,
}

impl Harness {
    fn new(registry: NodeRegistry, config: ExecutorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(256));
        let executor = GraphExecutor::new(
            Arc::new(registry),
            store.clone(),
            notifier.clone() as Arc<dyn Notifier>,
            config,
        );
        Self {
            store,
            notifier,
            executor,
        }
    }

    /// Create a `pending` record for `workflow` and the context it starts with.
    async fn pending(&self, workflow: &WorkflowDefinition, trigger: Value) -> ExecutionContext {
        let record = ExecutionRecord::new(workflow.id, json!({ "trigger": trigger }));
        self.store.create_execution(&record).await.unwrap();
        seed_context(workflow.id, record.id, &record.input)
    }

    async fn run(
        &self,
        workflow: &WorkflowDefinition,
        ctx: ExecutionContext,
    ) -> Result<crate::RunOutcome, EngineError> {
        self.executor
            .execute(workflow, ctx, &RunClaim::new(Uuid::new_v4()))
            .await
    }

    async fn record(&self, ctx_id: uuid::Uuid) -> ExecutionRecord {
        self.store.get_execution(ctx_id).await.unwrap()
    }

    async fn node_records(&self, ctx_id: uuid::Uuid) -> Vec<NodeExecutionRecord> {
        self.store.list_node_executions(ctx_id).await.unwrap()
    }
}

fn node(id: &str, node_type: &str) -> NodeSpec {
    NodeSpec::new(id, node_type, json!({}))
}

fn chain(nodes: Vec<NodeSpec>) -> WorkflowDefinition {
    let edges = nodes
        .windows(2)
        .map(|w| EdgeSpec::new(&w[0].id, &w[1].id))
        .collect();
    WorkflowDefinition::new("chain", nodes, edges)
}

fn ids(records: &[NodeExecutionRecord]) -> Vec<&str> {
    records.iter().map(|r| r.node_id.as_str()).collect()
}

/// Cancels its own run while executing.
struct CancelsRun {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl NodeHandler for CancelsRun {
    async fn execute(&self, _config: &Value, ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        self.store
            .transition_execution(ctx.execution_id, ExecutionStatus::Cancelled, None)
            .await
            .map_err(|e| NodeError::execution(e.to_string()))?;
        Ok(NodeResult::ok(json!({ "cancelled": true })))
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_delay_end_runs_in_order() {
    let end = Arc::new(MockNode::returning("end", json!({ "done": true })));
    let registry = NodeRegistry::with_builtins().with("end", end.clone());
    let h = Harness::new(registry, ExecutorConfig::default());

    let wf = chain(vec![
        node("start", "manual"),
        NodeSpec::new("delay", "delay", json!({ "ms": 5000 })),
        node("end", "end"),
    ]);
    let ctx = h.pending(&wf, json!({ "user": "ada" })).await;
    let id = ctx.execution_id;

    let outcome = h.run(&wf, ctx).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.visited, vec!["start", "delay", "end"]);

    let records = h.node_records(id).await;
    assert_eq!(ids(&records), vec!["start", "delay", "end"]);
    assert!(records.iter().all(|r| r.status == NodeStatus::Completed));
    assert_eq!(records[0].output, Some(json!({ "user": "ada" })));
    assert_eq!(records[1].output, Some(json!({ "delayed_ms": 5000 })));

    let record = h.record(id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.started_at.is_some() && record.finished_at.is_some());
    assert_eq!(record.last_node_id.as_deref(), Some("end"));
    assert_eq!(record.node_outputs["end"], json!({ "node": "end", "done": true }));
    assert_eq!(record.variables["trigger"], json!({ "user": "ada" }));
    assert_eq!(end.call_count(), 1);
}

#[tokio::test]
async fn outputs_flow_into_later_configs() {
    let first = Arc::new(MockNode::returning("a", json!({ "msg": "hi" })));
    let second = Arc::new(MockNode::returning("b", json!({})));
    let registry = NodeRegistry::new()
        .with("first", first)
        .with("second", second.clone());
    let h = Harness::new(registry, ExecutorConfig::default());

    let wf = chain(vec![
        node("a", "first"),
        NodeSpec::new("b", "second", json!({ "text": "{{node.a.msg}} {{missing}}" })),
    ]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;
    h.run(&wf, ctx).await.unwrap();

    assert_eq!(second.calls(), vec![json!({ "text": "hi {{missing}}" })]);
    let records = h.node_records(id).await;
    assert_eq!(records[1].input, json!({ "text": "hi {{missing}}" }));
}

#[tokio::test]
async fn diamond_join_runs_once_depth_first() {
    let registry = NodeRegistry::with_builtins();
    let h = Harness::new(registry, ExecutorConfig::default());

    let wf = WorkflowDefinition::new(
        "diamond",
        vec![
            node("a", "manual"),
            node("b", "manual"),
            node("c", "manual"),
            node("d", "manual"),
        ],
        vec![
            EdgeSpec::new("a", "b"),
            EdgeSpec::new("a", "c"),
            EdgeSpec::new("b", "d"),
            EdgeSpec::new("c", "d"),
        ],
    );
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;
    let outcome = h.run(&wf, ctx).await.unwrap();

    assert_eq!(outcome.visited, vec!["a", "b", "d", "c"]);
    assert_eq!(ids(&h.node_records(id).await), vec!["a", "b", "d", "c"]);
}

#[tokio::test]
async fn every_start_node_is_run() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let wf = WorkflowDefinition::new(
        "two roots",
        vec![node("x", "manual"), node("y", "manual"), node("z", "manual")],
        vec![EdgeSpec::new("x", "z")],
    );
    let ctx = h.pending(&wf, json!({})).await;
    let outcome = h.run(&wf, ctx).await.unwrap();
    assert_eq!(outcome.visited, vec!["x", "z", "y"]);
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_start_node_fails_before_any_node_runs() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let wf = WorkflowDefinition::new(
        "loop",
        vec![node("a", "manual"), node("b", "manual")],
        vec![EdgeSpec::new("a", "b"), EdgeSpec::new("b", "a")],
    );
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let err = h.run(&wf, ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::NoStartNode));
    assert!(err.is_run_failure());

    assert!(h.node_records(id).await.is_empty());
    let record = h.record(id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("workflow has no start node"));
    assert!(record.started_at.is_none());
}

#[tokio::test]
async fn cycle_fails_closed() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let wf = WorkflowDefinition::new(
        "cycle",
        vec![node("a", "manual"), node("b", "manual"), node("c", "manual")],
        vec![
            EdgeSpec::new("a", "b"),
            EdgeSpec::new("b", "c"),
            EdgeSpec::new("c", "b"),
        ],
    );
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let err = h.run(&wf, ctx).await.unwrap_err();
    assert!(matches!(&err, EngineError::CycleDetected(node) if node == "b"));
    assert!(h.node_records(id).await.is_empty());
    assert_eq!(
        h.record(id).await.error.as_deref(),
        Some("cycle detected at node b")
    );
}

#[tokio::test]
async fn unregistered_type_fails_before_any_node_runs() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let wf = chain(vec![node("start", "manual"), node("ask", "llm")]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let err = h.run(&wf, ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::UnregisteredNodeType { ref node_type, .. } if node_type == "llm"));
    assert!(h.node_records(id).await.is_empty());
    assert_eq!(h.record(id).await.status, ExecutionStatus::Failed);
}

// ---------------------------------------------------------------------------
// Node failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_node_halts_the_run() {
    let after = Arc::new(MockNode::returning("c", json!({})));
    let registry = NodeRegistry::with_builtins()
        .with("boom", Arc::new(MockNode::failing("b", "boom")))
        .with("after", after.clone());
    let h = Harness::new(registry, ExecutorConfig::default());

    let wf = chain(vec![node("a", "manual"), node("b", "boom"), node("c", "after")]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let err = h.run(&wf, ctx).await.unwrap_err();
    assert!(matches!(&err, EngineError::NodeFailed { node_id, .. } if node_id == "b"));

    let records = h.node_records(id).await;
    assert_eq!(ids(&records), vec!["a", "b"]);
    assert_eq!(records[1].status, NodeStatus::Failed);
    assert_eq!(records[1].error.as_deref(), Some("boom"));

    let record = h.record(id).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("node 'b' failed: boom"));
    assert_eq!(record.last_node_id.as_deref(), Some("b"));
    assert_eq!(after.call_count(), 0);
}

#[tokio::test]
async fn continue_on_error_records_failure_and_carries_on() {
    let registry = NodeRegistry::with_builtins()
        .with("boom", Arc::new(MockNode::failing("b", "boom")))
        .with("after", Arc::new(MockNode::returning("c", json!({}))));
    let h = Harness::new(registry, ExecutorConfig::default());

    let wf = chain(vec![
        node("a", "manual"),
        node("b", "boom").continue_on_error(true),
        node("c", "after"),
    ]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let outcome = h.run(&wf, ctx).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let records = h.node_records(id).await;
    let statuses: Vec<NodeStatus> = records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![NodeStatus::Completed, NodeStatus::Failed, NodeStatus::Completed]
    );
    assert_eq!(records[1].error.as_deref(), Some("boom"));
    assert_eq!(records[1].output, Some(json!({ "error": "boom" })));

    let record = h.record(id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.node_outputs["b"], json!({ "error": "boom" }));
}

#[tokio::test]
async fn node_flag_overrides_the_executor_default() {
    let registry = NodeRegistry::with_builtins()
        .with("boom", Arc::new(MockNode::failing("b", "boom")));
    let config = ExecutorConfig {
        continue_on_error: true,
        ..Default::default()
    };
    let h = Harness::new(registry, config);

    let lenient = chain(vec![node("a", "boom"), node("b", "manual")]);
    let ctx = h.pending(&lenient, json!({})).await;
    assert!(h.run(&lenient, ctx).await.is_ok());

    let strict = chain(vec![node("a", "boom").continue_on_error(false), node("b", "manual")]);
    let ctx = h.pending(&strict, json!({})).await;
    assert!(matches!(
        h.run(&strict, ctx).await,
        Err(EngineError::NodeFailed { .. })
    ));
}

#[tokio::test]
async fn reported_failure_does_not_stop_downstream_nodes() {
    let after = Arc::new(MockNode::returning("c", json!({})));
    let registry = NodeRegistry::with_builtins()
        .with("remote", Arc::new(MockNode::reporting_failure("b", "HTTP 503")))
        .with("after", after.clone());
    let h = Harness::new(registry, ExecutorConfig::default());

    let wf = chain(vec![node("a", "manual"), node("b", "remote"), node("c", "after")]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let outcome = h.run(&wf, ctx).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(after.call_count(), 1);

    let records = h.node_records(id).await;
    assert_eq!(records[1].status, NodeStatus::Completed);
    assert_eq!(
        records[1].output,
        Some(json!({ "node": "b", "success": false, "error": "HTTP 503" }))
    );
}

// ---------------------------------------------------------------------------
// Branching
// ---------------------------------------------------------------------------

fn branching_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "branching",
        vec![
            node("start", "manual"),
            NodeSpec::new("check", "condition", json!({ "expression": "trigger.amount > 100" })),
            node("big", "big"),
            node("small", "small"),
        ],
        vec![
            EdgeSpec::new("start", "check"),
            EdgeSpec::new("check", "big").with_branch("true"),
            EdgeSpec::new("check", "small").with_branch("false"),
        ],
    )
}

fn branch_mocks() -> (NodeRegistry, Arc<MockNode>, Arc<MockNode>) {
    let big = Arc::new(MockNode::returning("big", json!({})));
    let small = Arc::new(MockNode::returning("small", json!({})));
    let registry = NodeRegistry::with_builtins()
        .with("big", big.clone())
        .with("small", small.clone());
    (registry, big, small)
}

#[tokio::test]
async fn follow_all_runs_every_branch() {
    let (registry, big, small) = branch_mocks();
    let h = Harness::new(registry, ExecutorConfig::default());
    let wf = branching_workflow();

    let ctx = h.pending(&wf, json!({ "amount": 150 })).await;
    let outcome = h.run(&wf, ctx).await.unwrap();

    assert_eq!(outcome.visited, vec!["start", "check", "big", "small"]);
    assert_eq!((big.call_count(), small.call_count()), (1, 1));
}

#[tokio::test]
async fn match_branch_follows_only_the_taken_edge() {
    let (registry, big, small) = branch_mocks();
    let config = ExecutorConfig {
        branch_policy: BranchPolicy::MatchBranch,
        ..Default::default()
    };
    let h = Harness::new(registry, config);
    let wf = branching_workflow();

    let ctx = h.pending(&wf, json!({ "amount": 150 })).await;
    let outcome = h.run(&wf, ctx).await.unwrap();
    assert_eq!(outcome.visited, vec!["start", "check", "big"]);

    let ctx = h.pending(&wf, json!({ "amount": 20 })).await;
    let id = ctx.execution_id;
    let outcome = h.run(&wf, ctx).await.unwrap();
    assert_eq!(outcome.visited, vec!["start", "check", "small"]);
    assert_eq!(
        h.record(id).await.node_outputs["check"],
        json!({ "result": false, "branch": "false" })
    );

    assert_eq!((big.call_count(), small.call_count()), (1, 1));
}

// ---------------------------------------------------------------------------
// Cancellation, restarts and observers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_takes_effect_at_the_next_node() {
    let after = Arc::new(MockNode::returning("c", json!({})));
    let shared_store = Arc::new(MemoryStore::new());
    let notifier: Arc<dyn Notifier> = Arc::new(BroadcastNotifier::default());
    let registry = NodeRegistry::with_builtins()
        .with("cancel", Arc::new(CancelsRun { store: shared_store.clone() }))
        .with("after", after.clone());
    let executor = GraphExecutor::new(
        Arc::new(registry),
        shared_store.clone(),
        notifier,
        ExecutorConfig::default(),
    );

    let wf = chain(vec![node("a", "manual"), node("b", "cancel"), node("c", "after")]);
    let record = ExecutionRecord::new(wf.id, json!({}));
    shared_store.create_execution(&record).await.unwrap();
    let ctx = seed_context(wf.id, record.id, &record.input);

    let outcome = executor
        .execute(&wf, ctx, &RunClaim::new(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    assert_eq!(outcome.visited, vec!["a", "b"]);
    assert_eq!(after.call_count(), 0);

    let stored = shared_store.get_execution(record.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert_eq!(stored.last_node_id.as_deref(), Some("b"));
}

/// Overwrite a stored record, for setting up states a live run would not
/// produce on its own.
async fn overwrite(store: &MemoryStore, id: Uuid, edit: impl FnOnce(&mut ExecutionRecord)) {
    let mut record = store.get_execution(id).await.unwrap();
    edit(&mut record);
    store.create_execution(&record).await.unwrap();
}

fn long_ago() -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(1)
}

#[tokio::test]
async fn abandoned_run_restarts_from_scratch() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let wf = chain(vec![node("a", "manual"), node("b", "manual")]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    // An earlier worker got as far as `a`, then went silent.
    let dead_worker = Uuid::new_v4();
    h.store
        .claim_execution(id, dead_worker, Utc::now())
        .await
        .unwrap();
    let stale = NodeExecutionRecord::start(id, "a", "manual", json!({}));
    h.store.insert_node_execution(&stale).await.unwrap();
    overwrite(&h.store, id, |r| r.heartbeat_at = Some(long_ago())).await;

    let outcome = h.run(&wf, ctx).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let records = h.node_records(id).await;
    assert_eq!(ids(&records), vec!["a", "b"]);
    assert!(records.iter().all(|r| r.id != stale.id));
    assert_ne!(h.record(id).await.claimed_by, Some(dead_worker));
}

#[tokio::test]
async fn retried_attempt_picks_its_own_run_back_up() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let wf = chain(vec![node("a", "manual"), node("b", "manual")]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    // The first attempt crashed right after claiming; its heartbeat is fresh.
    let job = Uuid::new_v4();
    h.store.claim_execution(id, job, Utc::now()).await.unwrap();
    let stale = NodeExecutionRecord::start(id, "a", "manual", json!({}));
    h.store.insert_node_execution(&stale).await.unwrap();

    let outcome = h.executor.execute(&wf, ctx, &RunClaim::new(job)).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(ids(&h.node_records(id).await), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn live_run_is_not_taken_over() {
    let h = Arc::new(Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default()));
    let wf = Arc::new(chain(vec![
        NodeSpec::new("wait", "delay", json!({ "seconds": 10 })),
        node("end", "manual"),
    ]));
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let first = {
        let (h, wf, ctx) = (h.clone(), wf.clone(), ctx.clone());
        tokio::spawn(async move { h.run(&wf, ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let holder = h.record(id).await.claimed_by;
    assert!(holder.is_some());

    // A second worker picking up the same record backs off untouched.
    let err = h.run(&wf, ctx).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::RunUnavailable { execution_id, status: ExecutionStatus::Running } if execution_id == id
    ));
    assert!(!err.is_run_failure());
    assert_eq!(ids(&h.node_records(id).await), vec!["wait"]);
    assert_eq!(h.record(id).await.claimed_by, holder);

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(ids(&h.node_records(id).await), vec!["wait", "end"]);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_kept_up_during_long_nodes() {
    let config = ExecutorConfig {
        lease: Duration::from_secs(30),
        ..Default::default()
    };
    let h = Arc::new(Harness::new(NodeRegistry::with_builtins(), config));
    let wf = Arc::new(chain(vec![NodeSpec::new("wait", "delay", json!({ "seconds": 120 }))]));
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let run = {
        let (h, wf) = (h.clone(), wf.clone());
        tokio::spawn(async move { h.run(&wf, ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    overwrite(&h.store, id, |r| r.heartbeat_at = Some(long_ago())).await;

    tokio::time::sleep(Duration::from_secs(15)).await;
    let beat = h.record(id).await.heartbeat_at.unwrap();
    assert!(beat > Utc::now() - chrono::Duration::minutes(1));

    assert_eq!(run.await.unwrap().unwrap().status, ExecutionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn worker_that_lost_its_claim_stops_at_the_next_node() {
    let after = Arc::new(MockNode::returning("after", json!({})));
    let registry = NodeRegistry::with_builtins().with("after", after.clone());
    let h = Arc::new(Harness::new(registry, ExecutorConfig::default()));
    let wf = Arc::new(chain(vec![
        NodeSpec::new("wait", "delay", json!({ "seconds": 10 })),
        node("after", "after"),
    ]));
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;

    let run = {
        let (h, wf) = (h.clone(), wf.clone());
        tokio::spawn(async move { h.run(&wf, ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let usurper = Uuid::new_v4();
    overwrite(&h.store, id, |r| r.claimed_by = Some(usurper)).await;

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::RunUnavailable { .. }));
    assert_eq!(after.call_count(), 0);
    assert_eq!(h.record(id).await.claimed_by, Some(usurper));
}

/// Store whose completion write loses a race with a cancel.
struct CancelledAtTheWire {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl ExecutionStore for CancelledAtTheWire {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), DbError> {
        self.inner.create_execution(record).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, DbError> {
        self.inner.get_execution(id).await
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionRecord, DbError> {
        if status == ExecutionStatus::Completed {
            self.inner
                .transition_execution(id, ExecutionStatus::Cancelled, None)
                .await?;
        }
        self.inner.transition_execution(id, status, error).await
    }

    async fn claim_execution(
        &self,
        id: Uuid,
        owner: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>, DbError> {
        self.inner.claim_execution(id, owner, stale_before).await
    }

    async fn heartbeat_execution(&self, id: Uuid, owner: Uuid) -> Result<bool, DbError> {
        self.inner.heartbeat_execution(id, owner).await
    }

    async fn save_snapshot(
        &self,
        id: Uuid,
        variables: &Value,
        node_outputs: &Value,
        last_node_id: Option<&str>,
    ) -> Result<(), DbError> {
        self.inner
            .save_snapshot(id, variables, node_outputs, last_node_id)
            .await
    }

    async fn list_claimable(
        &self,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, DbError> {
        self.inner.list_claimable(limit, stale_before).await
    }

    async fn insert_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), DbError> {
        self.inner.insert_node_execution(record).await
    }

    async fn finish_node_execution(
        &self,
        id: Uuid,
        status: NodeStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<NodeExecutionRecord, DbError> {
        self.inner.finish_node_execution(id, status, output, error).await
    }

    async fn list_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, DbError> {
        self.inner.list_node_executions(execution_id).await
    }

    async fn delete_node_executions(&self, execution_id: Uuid) -> Result<u64, DbError> {
        self.inner.delete_node_executions(execution_id).await
    }
}

#[tokio::test]
async fn cancel_racing_completion_is_a_cancelled_outcome() {
    let memory = Arc::new(MemoryStore::new());
    let executor = GraphExecutor::new(
        Arc::new(NodeRegistry::with_builtins()),
        Arc::new(CancelledAtTheWire { inner: memory.clone() }),
        Arc::new(BroadcastNotifier::default()),
        ExecutorConfig::default(),
    );
    let wf = chain(vec![node("a", "manual")]);
    let record = ExecutionRecord::new(wf.id, json!({}));
    memory.create_execution(&record).await.unwrap();
    let ctx = seed_context(wf.id, record.id, &record.input);

    let outcome = executor
        .execute(&wf, ctx, &RunClaim::new(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    assert_eq!(outcome.visited, vec!["a"]);
    assert_eq!(
        memory.get_execution(record.id).await.unwrap().status,
        ExecutionStatus::Cancelled
    );
}

#[tokio::test]
async fn progress_is_reported_per_node() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let wf = chain(vec![node("a", "manual"), node("b", "manual")]);
    let ctx = h.pending(&wf, json!({})).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress = ProgressReporter::new(move |p| sink.lock().unwrap().push(p));
    let claim = RunClaim::new(Uuid::new_v4()).with_progress(progress);
    h.executor.execute(&wf, ctx, &claim).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            json!({ "node_id": "a", "completed": 1, "total": 2 }),
            json!({ "node_id": "b", "completed": 2, "total": 2 }),
        ]
    );
}

#[tokio::test]
async fn every_transition_is_published() {
    let h = Harness::new(NodeRegistry::with_builtins(), ExecutorConfig::default());
    let mut rx = h.notifier.subscribe();
    let wf = chain(vec![node("a", "manual")]);
    let ctx = h.pending(&wf, json!({})).await;
    let id = ctx.execution_id;
    h.run(&wf, ctx).await.unwrap();

    let execution_topic = format!("execution:{id}");
    let mut seen = Vec::new();
    while let Ok(n) = rx.try_recv() {
        if n.topic == execution_topic {
            seen.push((n.event.node_id, n.event.status));
        }
    }
    assert_eq!(
        seen,
        vec![
            (None, "running".to_owned()),
            (Some("a".to_owned()), "running".to_owned()),
            (Some("a".to_owned()), "completed".to_owned()),
            (None, "completed".to_owned()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn long_running_node_does_not_block_other_runs() {
    let registry = NodeRegistry::with_builtins();
    let h = Arc::new(Harness::new(registry, ExecutorConfig::default()));
    let slow = chain(vec![NodeSpec::new("wait", "delay", json!({ "seconds": 60 }))]);
    let fast = chain(vec![node("go", "manual")]);

    let slow_ctx = h.pending(&slow, json!({})).await;
    let fast_ctx = h.pending(&fast, json!({})).await;
    let slow_id = slow_ctx.execution_id;

    let slow_run = {
        let h = h.clone();
        tokio::spawn(async move { h.run(&slow, slow_ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    let fast_outcome = h.run(&fast, fast_ctx).await.unwrap();
    assert_eq!(fast_outcome.status, ExecutionStatus::Completed);
    assert_eq!(h.record(slow_id).await.status, ExecutionStatus::Running);

    let slow_outcome = slow_run.await.unwrap().unwrap();
    assert_eq!(slow_outcome.status, ExecutionStatus::Completed);
}
