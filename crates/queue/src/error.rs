//! Queue-level error type.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("queue '{0}' already has a processor")]
    ProcessorExists(String),

    #[error("queue is shutting down")]
    ShuttingDown,

    /// The job handler returned an error.
    #[error("{0}")]
    Handler(String),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("job handler panicked: {0}")]
    Panicked(String),
}

impl QueueError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
