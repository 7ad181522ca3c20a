//! Real-time status notifications.
//!
//! Every status transition is published to `execution:<id>` and
//! `workflow:<id>`.  Delivery is fire-and-forget and never affects the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use db::{ExecutionStatus, NodeStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn run(execution_id: Uuid, workflow_id: Uuid, status: ExecutionStatus) -> Self {
        Self {
            execution_id,
            workflow_id,
            node_id: None,
            status: status.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn node(
        execution_id: Uuid,
        workflow_id: Uuid,
        node_id: impl Into<String>,
        status: NodeStatus,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            node_id: Some(node_id.into()),
            status: status.to_string(),
            timestamp: Utc::now(),
        }
    }
}

pub fn execution_topic(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

pub fn workflow_topic(workflow_id: Uuid) -> String {
    format!("workflow:{workflow_id}")
}

pub trait Notifier: Send + Sync {
    fn publish(&self, topic: &str, event: &StatusEvent);
}

/// Publish `event` to its execution and workflow topics.
pub fn publish_status(notifier: &dyn Notifier, event: StatusEvent) {
    notifier.publish(&execution_topic(event.execution_id), &event);
    notifier.publish(&workflow_topic(event.workflow_id), &event);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, _topic: &str, _event: &StatusEvent) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub event: StatusEvent,
}

/// In-process fan-out.  Slow subscribers lag and lose events.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, topic: &str, event: &StatusEvent) {
        if self
            .tx
            .send(Notification {
                topic: topic.to_owned(),
                event: event.clone(),
            })
            .is_err()
        {
            trace!(topic, "no status subscribers");
        }
    }
}
