use std::collections::HashMap;

use serde_json::Value;

use crate::dsl::{BoundaryEvent, Branch, Edge, Node, NodeType, Process};
use crate::events::EventDefinition;

pub struct ProcessBuilder {
    id: String,
    name: String,
    version: String,
    variables: HashMap<String, Value>,
    pub nodes: Vec<Node>, // public so tests can tweak nodes by hand
    edges: Vec<Edge>,
}

impl ProcessBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            version: String::new(),
            variables: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn node(mut self, id: &str, kind: NodeType) -> Self {
        self.nodes.push(Node::new(id, kind));
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.node(id, NodeType::Start)
    }

    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeType::End { event: None })
    }

    pub fn end_with(self, id: &str, event: EventDefinition) -> Self {
        self.node(id, NodeType::End { event: Some(event) })
    }

    pub fn task(self, id: &str) -> Self {
        self.node(id, NodeType::Task)
    }

    pub fn script(self, id: &str, script: &str) -> Self {
        self.node(id, NodeType::Script { script: script.to_string() })
    }

    pub fn manual(self, id: &str) -> Self {
        self.node(id, NodeType::Manual)
    }

    pub fn exclusive(self, id: &str) -> Self {
        self.node(id, NodeType::ExclusiveGateway)
    }

    pub fn inclusive(self, id: &str) -> Self {
        self.node(id, NodeType::InclusiveGateway)
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.node(id, NodeType::ParallelGateway)
    }

    pub fn catch(self, id: &str, event: EventDefinition) -> Self {
        self.node(id, NodeType::IntermediateCatch { event })
    }

    pub fn throw(self, id: &str, event: EventDefinition) -> Self {
        self.node(id, NodeType::IntermediateThrow { event })
    }

    pub fn subprocess(self, id: &str, process: &str) -> Self {
        self.node(id, NodeType::SubProcess { process: process.to_string() })
    }

    /// Adds a parallel block; each branch is a linear chain of nodes.
    pub fn parallel(self, id: &str, branches: Vec<Vec<Node>>) -> Self {
        let branches = branches.into_iter().map(|nodes| Branch { nodes }).collect();
        self.node(id, NodeType::Parallel { branches })
    }

    pub fn thread_split(self, id: &str) -> ThreadSplitBuilder {
        ThreadSplitBuilder {
            process_builder: self,
            id: id.to_string(),
            times: None,
            collection: None,
            element_var: None,
        }
    }

    pub fn thread_merge(self, id: &str, split: &str) -> Self {
        self.node(id, NodeType::ThreadMerge { split: split.to_string() })
    }

    /// Attaches a boundary catch event to the node `attached_to`.
    pub fn boundary(mut self, attached_to: &str, id: &str, event: EventDefinition, interrupting: bool) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == attached_to) {
            node.boundary_events.push(BoundaryEvent {
                id: id.to_string(),
                event,
                interrupting,
            });
        }
        self
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        self.edges.push(Edge {
            condition: Some(condition.to_string()),
            ..Edge::new(source, target)
        });
        self
    }

    pub fn connect_default(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge {
            branch_type: Some("default".to_string()),
            ..Edge::new(source, target)
        });
        self
    }

    pub fn build(self) -> Process {
        Process {
            id: self.id,
            name: self.name,
            version: self.version,
            variables: self.variables,
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

pub struct ThreadSplitBuilder {
    process_builder: ProcessBuilder,
    id: String,
    times: Option<String>,
    collection: Option<String>,
    element_var: Option<String>,
}

impl ThreadSplitBuilder {
    pub fn times(mut self, expression: &str) -> Self {
        self.times = Some(expression.to_string());
        self
    }

    pub fn collection(mut self, expression: &str, element_var: &str) -> Self {
        self.collection = Some(expression.to_string());
        self.element_var = Some(element_var.to_string());
        self
    }

    pub fn build(mut self) -> ProcessBuilder {
        self.process_builder.nodes.push(Node::new(
            &self.id,
            NodeType::ThreadSplit {
                times: self.times,
                collection: self.collection,
                element_var: self.element_var,
            },
        ));
        self.process_builder
    }
}
