//! Node dispatch registry: type tag → handler.
//!
//! Handlers are constructed by the embedding process and registered
//! explicitly, so connector clients are never shared through globals and
//! tests can register fakes.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::builtin;
use crate::{ExecutionContext, NodeError, NodeHandler, NodeResult};

#[derive(Clone, Default)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in handler (`manual`, `transform`,
    /// `condition`, `delay`, `api`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Register `handler` for `node_type`, replacing any previous handler.
    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        self.register(node_type, handler);
        self
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered type tags, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Resolve `node_type`, interpolate `config` against `ctx`, and run the
    /// handler.
    ///
    /// # Errors
    /// [`NodeError::UnknownType`] when nothing is registered for the tag;
    /// otherwise whatever the handler raises.
    #[instrument(skip(self, config, ctx), fields(execution_id = %ctx.execution_id))]
    pub async fn dispatch(
        &self,
        node_type: &str,
        config: &Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeResult, NodeError> {
        let resolved = ctx.resolve_value(config);
        self.dispatch_resolved(node_type, &resolved, ctx).await
    }

    /// [`dispatch`](Self::dispatch) for a config the caller has already
    /// interpolated against `ctx`.
    pub async fn dispatch_resolved(
        &self,
        node_type: &str,
        resolved: &Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeResult, NodeError> {
        let handler = self
            .get(node_type)
            .ok_or_else(|| NodeError::UnknownType(node_type.to_owned()))?;
        debug!("dispatching to '{}' handler", node_type);
        handler.execute(resolved, ctx).await
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
