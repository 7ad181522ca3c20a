//! `nodes` crate: the per-run execution context, the `NodeHandler` trait
//! and the built-in node implementations.
//!
//! Every node type, built-in and application-provided alike, implements
//! [`NodeHandler`] and is looked up by type tag through a [`NodeRegistry`].
//! The engine crate dispatches execution through that registry.

pub mod builtin;
pub mod condition;
pub mod context;
pub mod error;
mod mapping;
pub mod mock;
pub mod registry;
mod template;
pub mod traits;
pub mod value;

pub use context::{ContextMetadata, ContextSnapshot, ExecutionContext, NodeOutput, Variable};
pub use error::NodeError;
pub use registry::NodeRegistry;
pub use traits::{NodeHandler, NodeResult};
pub use value::ValueKind;
