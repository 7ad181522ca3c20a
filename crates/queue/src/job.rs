//! Job definitions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::Backoff;

/// Job priority levels.  Higher priorities are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting for a free slot.
    Waiting,
    Active,
    /// Failed an attempt, waiting out its backoff.
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-job overrides of the lane defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub timeout: Option<Duration>,
    /// Idempotency key: while a job with this key is waiting, running or
    /// backing off, adding another one returns the existing job.
    pub dedup_key: Option<String>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts.max(1));
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub queue: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle notifications broadcast by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub queue: String,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    Active { attempt: u32 },
    Progress(Value),
    Completed(Value),
    /// The payload travels with the event so observers need not look the
    /// job up after it may have been evicted.
    Failed {
        error: String,
        will_retry: bool,
        payload: Value,
    },
}

/// Handed to the job handler for each attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: Uuid,
    pub queue: String,
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress: ProgressReporter,
}

impl JobContext {
    /// Whether a failure of this attempt would be final.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

type ProgressFn = dyn Fn(Value) + Send + Sync;

/// Publishes progress updates for a running job.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Option<Arc<ProgressFn>>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// A reporter that discards every update.
    pub fn noop() -> Self {
        Self { sink: None }
    }

    pub fn report(&self, progress: Value) {
        if let Some(sink) = &self.sink {
            sink(progress);
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

/// Handle to an enqueued job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    rx: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    pub(crate) fn new(id: Uuid, rx: watch::Receiver<JobSnapshot>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait until the job is `completed` or `failed`.
    pub async fn wait(mut self) -> JobSnapshot {
        // Err means the queue was dropped; the last snapshot is all there is.
        let _ = self.rx.wait_for(|s| s.state.is_terminal()).await;
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn progress_reporter_forwards_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(move |v| sink.lock().unwrap().push(v));

        reporter.report(serde_json::json!({"completed": 1}));
        ProgressReporter::noop().report(serde_json::json!({"ignored": true}));

        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({"completed": 1})]);
    }
}
