use std::collections::HashMap;

use tracing::debug;

use crate::compiler::expander::{thread_start_id, Expander};
use crate::dsl::{Edge, Node, NodeType, Process};
use crate::error::StructuralError;
use crate::runtime::blueprint::{Blueprint, Branch, GatewayKind, SpecKind, TaskSpec};

/// Turns a [`Process`] into a validated [`Blueprint`].
#[derive(Debug, Default)]
pub struct Compiler {
    id_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&mut self, raw_process: Process) -> Result<Blueprint, StructuralError> {
        // Pass 0: expand composite nodes
        let process = Expander::new().expand(raw_process)?;

        // Pass 1: index
        self.id_map.clear();
        for (idx, node) in process.nodes.iter().enumerate() {
            if self.id_map.insert(node.id.clone(), idx).is_some() {
                return Err(StructuralError::DuplicateSpec(node.id.clone()));
            }
        }

        // Pass 2: wire edges
        let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
        let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &process.edges {
            for end in [&edge.source, &edge.target] {
                if !self.id_map.contains_key(end) {
                    return Err(StructuralError::DanglingEdge {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                    });
                }
            }
            outgoing.entry(edge.source.as_str()).or_default().push(edge);
            incoming.entry(edge.target.as_str()).or_default().push(edge.source.as_str());
        }

        // Pass 3: transform
        let mut specs = Vec::with_capacity(process.nodes.len());
        for node in &process.nodes {
            let edges = outgoing.get(node.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let inputs = incoming.get(node.id.as_str()).cloned().unwrap_or_default();
            specs.push(self.transform_node(node, edges, &inputs)?);
        }

        // Pass 4: start node
        let mut starts = process.nodes.iter().filter(|n| matches!(n.kind, NodeType::Start));
        let start = starts
            .next()
            .ok_or_else(|| StructuralError::MissingStart(process.id.clone()))?;
        if let Some(extra) = starts.next() {
            return Err(StructuralError::Invalid(format!(
                "process '{}' has more than one start ('{}', '{}')",
                process.id, start.id, extra.id
            )));
        }

        debug!(process = %process.id, specs = specs.len(), "process compiled");
        let blueprint = Blueprint::new(&process.id, &process.name, &process.version, &start.id, specs)?;
        Ok(blueprint.with_variables(process.variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
    }

    fn transform_node(&self, node: &Node, edges: &[&Edge], inputs: &[&str]) -> Result<TaskSpec, StructuralError> {
        let kind = match &node.kind {
            NodeType::Start => SpecKind::Start,
            NodeType::End { event } => SpecKind::End { event: event.clone() },
            NodeType::Task => SpecKind::Task,
            NodeType::Script { script } => SpecKind::Script { script: script.clone() },
            NodeType::Manual => SpecKind::Manual,
            NodeType::ExclusiveGateway => SpecKind::Gateway {
                gateway: GatewayKind::Exclusive,
                conditions: self.branches(node, edges)?,
            },
            NodeType::InclusiveGateway => SpecKind::Gateway {
                gateway: GatewayKind::Inclusive,
                conditions: self.branches(node, edges)?,
            },
            NodeType::ParallelGateway => SpecKind::Gateway {
                gateway: GatewayKind::Parallel,
                conditions: Vec::new(),
            },
            NodeType::IntermediateCatch { event } => SpecKind::CatchEvent { event: event.clone() },
            NodeType::IntermediateThrow { event } => SpecKind::ThrowEvent { event: event.clone() },
            NodeType::SubProcess { process } => SpecKind::SubProcess { process: process.clone() },
            NodeType::ThreadSplit { times, collection, element_var } => SpecKind::ThreadSplit {
                times: times.clone(),
                collection: collection.clone(),
                element_var: element_var.clone(),
                thread_start: thread_start_id(&node.id),
            },
            NodeType::ThreadMerge { split } => SpecKind::ThreadMerge { split: split.clone() },
            NodeType::ThreadStart => SpecKind::ThreadStart,
            NodeType::BoundaryParent { main } => SpecKind::BoundaryParent { main: main.clone() },
            NodeType::Boundary { event, interrupting } => SpecKind::Boundary {
                event: event.clone(),
                interrupting: *interrupting,
            },
            NodeType::Parallel { .. } => {
                return Err(StructuralError::Invalid(format!(
                    "parallel node '{}' should have been expanded",
                    node.id
                )));
            }
        };

        Ok(TaskSpec {
            name: node.id.clone(),
            description: node.description.clone(),
            internal: node.internal,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: edges.iter().map(|e| e.target.clone()).collect(),
            kind,
        })
    }

    /// Conditional edges in edge order. An edge marked default, or the one
    /// unconditional edge among conditional ones, becomes the default branch.
    fn branches(&self, node: &Node, edges: &[&Edge]) -> Result<Vec<Branch>, StructuralError> {
        if edges.iter().all(|e| e.condition.is_none() && !e.is_default()) {
            return Ok(Vec::new());
        }
        let mut branches = Vec::with_capacity(edges.len());
        let mut has_default = false;
        for edge in edges {
            if edge.condition.is_none() || edge.is_default() {
                if has_default {
                    return Err(StructuralError::Invalid(format!(
                        "gateway '{}' has more than one default branch",
                        node.id
                    )));
                }
                has_default = true;
                branches.push(Branch { condition: None, target: edge.target.clone() });
            } else {
                branches.push(Branch {
                    condition: edge.condition.clone(),
                    target: edge.target.clone(),
                });
            }
        }
        Ok(branches)
    }
}

/// Compiles a process in one call.
pub fn compile(process: Process) -> Result<Blueprint, StructuralError> {
    Compiler::new().compile(process)
}
