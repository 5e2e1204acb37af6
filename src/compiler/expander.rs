use std::collections::VecDeque;

use tracing::debug;

use crate::dsl::{Branch, Edge, Node, NodeType, Process};
use crate::error::StructuralError;

/// Id of the internal thread start generated for a thread split.
pub fn thread_start_id(split: &str) -> String {
    format!("{}_thread_start", split)
}

/// Id of the internal node a task with boundary events is wrapped in.
pub fn boundary_parent_id(main: &str) -> String {
    format!("{}_boundary", main)
}

/// Rewrites authored constructs into the nodes the engine runs:
/// parallel blocks become a split/join gateway pair, thread splits get an
/// internal thread start, and boundary events hang off an internal parent.
#[derive(Debug, Default)]
pub struct Expander;

impl Expander {
    pub fn new() -> Self {
        Self
    }

    pub fn expand(&self, process: Process) -> Result<Process, StructuralError> {
        let mut new_nodes = Vec::new();
        let mut new_edges = process.edges.clone();

        let mut pending = VecDeque::from(process.nodes);
        while let Some(node) = pending.pop_front() {
            if let NodeType::Parallel { branches } = node.kind {
                // Branch nodes may be composite themselves.
                let flattened = self.expand_parallel(&node.id, branches, &mut new_edges)?;
                new_nodes.push(Node::internal(&format!("{}_split", node.id), NodeType::ParallelGateway));
                new_nodes.push(Node::internal(&format!("{}_join", node.id), NodeType::ParallelGateway));
                pending.extend(flattened);
                continue;
            }

            if matches!(node.kind, NodeType::ThreadSplit { .. }) {
                let start = thread_start_id(&node.id);
                for edge in new_edges.iter_mut().filter(|e| e.source == node.id) {
                    edge.source = start.clone();
                }
                new_nodes.push(Node::internal(&start, NodeType::ThreadStart));
            }
            if node.boundary_events.is_empty() {
                new_nodes.push(node);
            } else {
                let main = Node {
                    boundary_events: Vec::new(),
                    ..node.clone()
                };
                self.expand_boundaries(node, &mut new_nodes, &mut new_edges);
                new_nodes.push(main);
            }
        }

        Ok(Process {
            nodes: new_nodes,
            edges: new_edges,
            ..process
        })
    }

    fn expand_parallel(
        &self,
        parallel_id: &str,
        branches: Vec<Branch>,
        new_edges: &mut Vec<Edge>,
    ) -> Result<Vec<Node>, StructuralError> {
        let split_id = format!("{}_split", parallel_id);
        let join_id = format!("{}_join", parallel_id);
        debug!(parallel = %parallel_id, branches = branches.len(), "expanding parallel block");

        // Edges into the block start at the split, edges out of it leave
        // from the join.
        for edge in new_edges.iter_mut() {
            if edge.target == parallel_id {
                edge.target = split_id.clone();
            }
            if edge.source == parallel_id {
                edge.source = join_id.clone();
            }
        }

        let mut nodes = Vec::new();
        let mut non_empty = 0;
        for branch in branches {
            let (Some(head), Some(tail)) = (branch.nodes.first(), branch.nodes.last()) else {
                continue;
            };
            non_empty += 1;
            new_edges.push(Edge::new(&split_id, &head.id));
            for pair in branch.nodes.windows(2) {
                new_edges.push(Edge::new(&pair[0].id, &pair[1].id));
            }
            new_edges.push(Edge::new(&tail.id, &join_id));
            nodes.extend(branch.nodes);
        }
        if non_empty == 0 {
            return Err(StructuralError::Invalid(format!(
                "parallel block '{}' has no branches",
                parallel_id
            )));
        }
        Ok(nodes)
    }

    /// `main` is entered through an internal boundary parent whose outputs are
    /// the main node and its boundary catchers.
    fn expand_boundaries(&self, main: Node, new_nodes: &mut Vec<Node>, new_edges: &mut Vec<Edge>) {
        let parent_id = boundary_parent_id(&main.id);
        for edge in new_edges.iter_mut().filter(|e| e.target == main.id) {
            edge.target = parent_id.clone();
        }
        new_edges.push(Edge::new(&parent_id, &main.id));
        for boundary in main.boundary_events {
            new_edges.push(Edge::new(&parent_id, &boundary.id));
            new_nodes.push(Node::new(
                &boundary.id,
                NodeType::Boundary {
                    event: boundary.event,
                    interrupting: boundary.interrupting,
                },
            ));
        }
        new_nodes.push(Node::internal(
            &parent_id,
            NodeType::BoundaryParent { main: main.id },
        ));
    }
}
