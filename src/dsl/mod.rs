pub mod builder;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventDefinition;

/// A resolved process definition, as handed over by a definition parser or
/// written by hand in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Process {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Initial data of a new run.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NodeType {
    Start,
    End {
        #[serde(default)]
        event: Option<EventDefinition>,
    },
    Task,
    Script {
        script: String,
    },
    Manual,
    // Conditions live on the outgoing edges.
    ExclusiveGateway,
    InclusiveGateway,
    ParallelGateway,
    IntermediateCatch {
        event: EventDefinition,
    },
    IntermediateThrow {
        event: EventDefinition,
    },
    SubProcess {
        process: String,
    },
    /// Branches run side by side and meet again before the next node.
    Parallel {
        branches: Vec<Branch>,
    },
    /// Everything after the split runs once per thread until the merge.
    ThreadSplit {
        #[serde(default)]
        times: Option<String>,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        element_var: Option<String>,
    },
    ThreadMerge {
        split: String,
    },

    // --- Internal nodes, generated by the Expander; not for YAML ---
    ThreadStart,
    BoundaryParent {
        main: String,
    },
    Boundary {
        event: EventDefinition,
        interrupting: bool,
    },
}

/// A linear chain of nodes inside a parallel block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: NodeType,
    /// Catch events attached to this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundary_events: Vec<BoundaryEvent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
}

impl Node {
    pub fn new(id: &str, kind: NodeType) -> Self {
        Self {
            id: id.to_string(),
            description: None,
            kind,
            boundary_events: Vec::new(),
            internal: false,
        }
    }

    pub fn internal(id: &str, kind: NodeType) -> Self {
        Self { internal: true, ..Self::new(id, kind) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundaryEvent {
    pub id: String,
    pub event: EventDefinition,
    #[serde(default = "default_interrupting")]
    pub interrupting: bool,
}

fn default_interrupting() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
    /// `"default"` (or `"else"`) marks a gateway's default branch.
    #[serde(default)]
    pub branch_type: Option<String>,
}

impl Edge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            branch_type: None,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self.branch_type.as_deref(), Some("default" | "else"))
    }
}
