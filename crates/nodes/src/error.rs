//! Node-level error type.

use thiserror::Error;

/// Errors raised by node handlers and by dispatch.
///
/// Expected remote failures (bad HTTP status, provider error) are *not*
/// errors: handlers report them through [`NodeResult::failure`](crate::NodeResult::failure)
/// so the executor's continue/halt policy applies uniformly.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// Missing credentials, malformed config and the like.
    #[error("configuration error: {0}")]
    Config(String),

    /// The handler could not complete for a non-remote reason.
    #[error("{0}")]
    Execution(String),

    /// No handler is registered for the node's type tag.
    #[error("no handler registered for node type '{0}'")]
    UnknownType(String),
}

impl NodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}
