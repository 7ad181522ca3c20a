//! `queue` crate: in-process job queue with named lanes, priorities,
//! retry with backoff, per-job timeouts and lifecycle events.

pub mod backoff;
pub mod config;
pub mod error;
pub mod job;
pub mod queue;

pub use backoff::Backoff;
pub use config::{LaneConfig, QueueConfig};
pub use error::{QueueError, Result};
pub use job::{
    JobContext, JobEvent, JobEventKind, JobHandle, JobOptions, JobPriority, JobSnapshot, JobState,
    ProgressReporter,
};
pub use queue::{handler_fn, FnHandler, JobHandler, JobQueue};
