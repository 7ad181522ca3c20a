//! Lane-routed node dispatch.
//!
//! Routing a node type through a lane swaps its registry entry for a
//! [`LaneDispatch`] that enqueues every call on that lane and waits for the
//! result.  The lane's worker rebuilds the context from the snapshot in the
//! job and runs the original handler, so the call inherits the lane's
//! concurrency limit, attempt budget and timeout.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use nodes::{ExecutionContext, NodeError, NodeHandler, NodeRegistry, NodeResult};
use queue::{JobContext, JobHandler, JobOptions, JobQueue, JobState, QueueError};

use crate::EngineError;

/// Payload of a routed node call.
#[derive(Debug, Serialize, Deserialize)]
struct LaneRequest {
    node_type: String,
    config: Value,
    context: Value,
    workflow_id: Uuid,
    execution_id: Uuid,
}

/// What a lane worker hands back.  Configuration errors travel as a reply
/// rather than a job failure so the queue does not retry them.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum LaneReply {
    Done { result: NodeResult },
    Rejected { message: String },
}

fn reply(reply: LaneReply) -> queue::Result<Value> {
    serde_json::to_value(reply).map_err(|e| QueueError::handler(format!("unencodable lane reply: {e}")))
}

/// A [`NodeHandler`] that runs each call as a job on a lane.
pub struct LaneDispatch {
    queue: JobQueue,
    lane: String,
    node_type: String,
}

impl LaneDispatch {
    pub fn new(queue: JobQueue, lane: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            queue,
            lane: lane.into(),
            node_type: node_type.into(),
        }
    }
}

#[async_trait]
impl NodeHandler for LaneDispatch {
    #[instrument(skip(self, config, ctx), fields(lane = %self.lane, node_type = %self.node_type))]
    async fn execute(&self, config: &Value, ctx: &ExecutionContext) -> Result<NodeResult, NodeError> {
        let request = LaneRequest {
            node_type: self.node_type.clone(),
            config: config.clone(),
            context: ctx.to_value(),
            workflow_id: ctx.workflow_id,
            execution_id: ctx.execution_id,
        };
        let job = self
            .queue
            .add(&self.lane, json!(request), JobOptions::default())
            .map_err(|e| NodeError::execution(format!("could not enqueue on '{}': {e}", self.lane)))?;
        debug!(job_id = %job.id(), "node call queued");

        let finished = job.wait().await;
        match finished.state {
            JobState::Completed => {
                let reply = finished.result.unwrap_or(Value::Null);
                match serde_json::from_value::<LaneReply>(reply) {
                    Ok(LaneReply::Done { result }) => Ok(result),
                    Ok(LaneReply::Rejected { message }) => Err(NodeError::Config(message)),
                    Err(e) => Err(NodeError::execution(format!("malformed lane reply: {e}"))),
                }
            }
            _ => Err(NodeError::Execution(
                finished
                    .error
                    .unwrap_or_else(|| format!("job on lane '{}' failed", self.lane)),
            )),
        }
    }
}

/// Runs routed calls on one lane.
struct LaneWorker {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

#[async_trait]
impl JobHandler for LaneWorker {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue, attempt = job.attempt))]
    async fn handle(&self, job: JobContext) -> queue::Result<Value> {
        let request: LaneRequest = serde_json::from_value(job.payload)
            .map_err(|e| QueueError::handler(format!("malformed node call: {e}")))?;
        let handler = self.handlers.get(&request.node_type).ok_or_else(|| {
            QueueError::handler(format!("node type '{}' is not routed here", request.node_type))
        })?;

        let mut ctx = ExecutionContext::new(request.workflow_id, request.execution_id);
        ctx.restore(&request.context);

        match handler.execute(&request.config, &ctx).await {
            Ok(result) => reply(LaneReply::Done { result }),
            Err(NodeError::Config(message)) => reply(LaneReply::Rejected { message }),
            Err(e) => {
                warn!(error = %e, "routed node call failed");
                Err(QueueError::handler(e.to_string()))
            }
        }
    }
}

/// Moves node types onto lanes and starts the workers serving them.
pub struct LaneRouter {
    queue: JobQueue,
    routes: HashMap<String, HashMap<String, Arc<dyn NodeHandler>>>,
}

impl LaneRouter {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            routes: HashMap::new(),
        }
    }

    /// Route `node_type` through `lane`, replacing its registry entry.
    ///
    /// # Errors
    /// [`EngineError::UnroutableNodeType`] if the type has no handler, or a
    /// queue error if the lane does not exist.
    pub fn route(
        &mut self,
        registry: &mut NodeRegistry,
        node_type: &str,
        lane: &str,
    ) -> Result<(), EngineError> {
        if !self.queue.queue_names().contains(&lane) {
            return Err(QueueError::UnknownQueue(lane.to_owned()).into());
        }
        let inner = registry
            .get(node_type)
            .ok_or_else(|| EngineError::UnroutableNodeType(node_type.to_owned()))?;

        registry.register(
            node_type,
            Arc::new(LaneDispatch::new(self.queue.clone(), lane, node_type)),
        );
        self.routes
            .entry(lane.to_owned())
            .or_default()
            .insert(node_type.to_owned(), inner);
        Ok(())
    }

    /// Attach a worker to every lane that received a route.
    pub fn start(self) -> Result<(), EngineError> {
        for (lane, handlers) in self.routes {
            info!(lane = %lane, node_types = handlers.len(), "starting lane worker");
            self.queue.process(&lane, Arc::new(LaneWorker { handlers }))?;
        }
        Ok(())
    }
}
