//! Graph validation and traversal helpers: run before any node executes.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. Every node type must have a registered handler.
//! 4. At least one node must have no incoming edge (a start node).
//! 5. The directed graph must be acyclic.

use std::collections::HashMap;

use nodes::NodeRegistry;

use crate::models::{EdgeSpec, NodeSpec, WorkflowDefinition};
use crate::EngineError;

/// Index over a [`WorkflowDefinition`].  Node and edge order follow the
/// definition.
#[derive(Debug)]
pub struct Graph<'a> {
    workflow: &'a WorkflowDefinition,
    index: HashMap<&'a str, usize>,
    outgoing: Vec<Vec<&'a EdgeSpec>>,
    incoming: Vec<usize>,
}

impl<'a> Graph<'a> {
    /// Index the workflow, checking ids and edge endpoints.
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
    pub fn build(workflow: &'a WorkflowDefinition) -> Result<Self, EngineError> {
        let mut index = HashMap::with_capacity(workflow.nodes.len());
        for (i, node) in workflow.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(EngineError::DuplicateNodeId(node.id.clone()));
            }
        }

        let mut outgoing = vec![Vec::new(); workflow.nodes.len()];
        let mut incoming = vec![0usize; workflow.nodes.len()];
        for edge in &workflow.edges {
            let unknown = |node_id: &str, side| EngineError::UnknownNodeReference {
                edge_id: edge.id.clone(),
                node_id: node_id.to_owned(),
                side,
            };
            let source = *index
                .get(edge.source.as_str())
                .ok_or_else(|| unknown(&edge.source, "source"))?;
            let target = *index
                .get(edge.target.as_str())
                .ok_or_else(|| unknown(&edge.target, "target"))?;
            outgoing[source].push(edge);
            incoming[target] += 1;
        }

        Ok(Self {
            workflow,
            index,
            outgoing,
            incoming,
        })
    }

    /// Build and run every check.
    ///
    /// # Errors
    /// Any [`build`](Self::build) error, plus
    /// [`EngineError::UnregisteredNodeType`], [`EngineError::NoStartNode`]
    /// and [`EngineError::CycleDetected`].
    pub fn validate(
        workflow: &'a WorkflowDefinition,
        registry: &NodeRegistry,
    ) -> Result<Self, EngineError> {
        let graph = Self::build(workflow)?;

        if let Some(node) = workflow.nodes.iter().find(|n| !registry.contains(&n.node_type)) {
            return Err(EngineError::UnregisteredNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
        }
        if graph.start_nodes().next().is_none() {
            return Err(EngineError::NoStartNode);
        }
        if let Some(node_id) = graph.find_cycle() {
            return Err(EngineError::CycleDetected(node_id.to_owned()));
        }

        Ok(graph)
    }

    pub fn node(&self, id: &str) -> Option<&'a NodeSpec> {
        self.index.get(id).map(|&i| &self.workflow.nodes[i])
    }

    /// Nodes with no incoming edge, in definition order.
    pub fn start_nodes(&self) -> impl DoubleEndedIterator<Item = &'a NodeSpec> + '_ {
        self.workflow
            .nodes
            .iter()
            .zip(&self.incoming)
            .filter(|(_, &n)| n == 0)
            .map(|(node, _)| node)
    }

    /// Edges leaving `node_id`, in definition order.
    pub fn outgoing(&self, node_id: &str) -> &[&'a EdgeSpec] {
        self.index
            .get(node_id)
            .map(|&i| self.outgoing[i].as_slice())
            .unwrap_or(&[])
    }

    /// First node found to close a cycle, if any.
    ///
    /// Iterative depth-first search with three colours; the reported node is
    /// the target of the first back edge.
    pub fn find_cycle(&self) -> Option<&'a str> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        let mut marks = vec![Mark::New; self.workflow.nodes.len()];
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.workflow.nodes.len() {
            if marks[root] != Mark::New {
                continue;
            }
            marks[root] = Mark::Open;
            stack.push((root, 0));

            while let Some((node, next_edge)) = stack.last_mut() {
                let Some(edge) = self.outgoing[*node].get(*next_edge) else {
                    marks[*node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                *next_edge += 1;

                let target = self.index[edge.target.as_str()];
                match marks[target] {
                    Mark::Open => return Some(self.workflow.nodes[target].id.as_str()),
                    Mark::New => {
                        marks[target] = Mark::Open;
                        stack.push((target, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }
}

/// Validate a workflow against a registry without executing it.
pub fn validate_workflow(
    workflow: &WorkflowDefinition,
    registry: &NodeRegistry,
) -> Result<(), EngineError> {
    Graph::validate(workflow, registry).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> NodeSpec {
        NodeSpec::new(id, "manual", json!({}))
    }

    fn workflow(ids: &[&str], edges: &[(&str, &str)]) -> WorkflowDefinition {
        WorkflowDefinition::new(
            "test",
            ids.iter().map(|id| node(id)).collect(),
            edges.iter().map(|(s, t)| EdgeSpec::new(*s, *t)).collect(),
        )
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::with_builtins()
    }

    #[test]
    fn start_nodes_in_definition_order() {
        let wf = workflow(&["b", "a", "c"], &[("b", "c")]);
        let graph = Graph::validate(&wf, &registry()).expect("valid");
        let starts: Vec<&str> = graph.start_nodes().map(|n| n.id.as_str()).collect();
        assert_eq!(starts, vec!["b", "a"]);
    }

    #[test]
    fn outgoing_edges_keep_definition_order() {
        let wf = workflow(&["a", "b", "c"], &[("a", "c"), ("a", "b")]);
        let graph = Graph::build(&wf).unwrap();
        let targets: Vec<&str> = graph.outgoing("a").iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets, vec!["c", "b"]);
        assert!(graph.outgoing("missing").is_empty());
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let wf = workflow(&["a", "a"], &[]);
        assert!(matches!(
            Graph::build(&wf),
            Err(EngineError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let wf = workflow(&["a"], &[("a", "ghost")]);
        assert!(matches!(
            Graph::build(&wf),
            Err(EngineError::UnknownNodeReference { node_id, side: "target", .. }) if node_id == "ghost"
        ));
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let mut wf = workflow(&["a"], &[]);
        wf.nodes[0].node_type = "llm".into();
        assert!(matches!(
            validate_workflow(&wf, &registry()),
            Err(EngineError::UnregisteredNodeType { node_type, .. }) if node_type == "llm"
        ));
    }

    #[test]
    fn no_start_node_is_rejected() {
        let wf = workflow(&["a", "b"], &[("a", "b"), ("b", "a")]);
        assert!(matches!(
            validate_workflow(&wf, &registry()),
            Err(EngineError::NoStartNode)
        ));
    }

    #[test]
    fn cycle_behind_a_start_node_is_detected() {
        // a → b → c → b
        let wf = workflow(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]);
        let err = validate_workflow(&wf, &registry()).unwrap_err();
        assert!(matches!(&err, EngineError::CycleDetected(id) if id == "b"));
        assert_eq!(err.to_string(), "cycle detected at node b");
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let wf = workflow(&["a", "b"], &[("a", "b"), ("b", "b")]);
        let graph = Graph::build(&wf).unwrap();
        assert_eq!(graph.find_cycle(), Some("b"));
    }

    #[test]
    fn diamond_is_acyclic() {
        let wf = workflow(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let graph = Graph::validate(&wf, &registry()).expect("diamond is valid");
        assert_eq!(graph.find_cycle(), None);
        let starts: Vec<&str> = graph.start_nodes().map(|n| n.id.as_str()).collect();
        assert_eq!(starts, vec!["a"]);
    }

    #[test]
    fn long_chains_do_not_recurse() {
        let ids: Vec<String> = (0..10_000).map(|i| format!("n{i}")).collect();
        let nodes = ids.iter().map(|id| node(id)).collect();
        let edges = ids.windows(2).map(|w| EdgeSpec::new(&w[0], &w[1])).collect();
        let wf = WorkflowDefinition::new("long", nodes, edges);

        let graph = Graph::validate(&wf, &registry()).expect("valid chain");
        assert_eq!(graph.start_nodes().count(), 1);
        assert_eq!(graph.outgoing("n9999").len(), 0);
    }
}
