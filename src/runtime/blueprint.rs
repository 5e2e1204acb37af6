use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StructuralError;
use crate::events::EventDefinition;

/// Compiled process definition. Immutable once built and shared by `Arc`
/// across every running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BlueprintDocument", into = "BlueprintDocument")]
pub struct Blueprint {
    pub id: String,
    pub name: String,
    pub version: String,
    pub start: String,
    /// Initial data of every run.
    pub variables: Map<String, Value>,
    specs: Vec<TaskSpec>,
    index: HashMap<String, usize>,
}

/// Serialized form of a blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintDocument {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub start: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    pub task_specs: Vec<TaskSpec>,
}

/// One node of the definition graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Synthesized by the compiler, never authored.
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(flatten)]
    pub kind: SpecKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Exclusive,
    Inclusive,
    Parallel,
}

/// A conditional outgoing edge of a gateway. No condition marks the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typename")]
pub enum SpecKind {
    Start,
    End {
        #[serde(default)]
        event: Option<EventDefinition>,
    },
    Task,
    Script {
        script: String,
    },
    /// Human work: parks in STARTED until the driver submits it.
    Manual,
    Gateway {
        gateway: GatewayKind,
        #[serde(default)]
        conditions: Vec<Branch>,
    },
    CatchEvent {
        event: EventDefinition,
    },
    ThrowEvent {
        event: EventDefinition,
    },
    Boundary {
        event: EventDefinition,
        #[serde(default = "default_interrupting")]
        interrupting: bool,
    },
    BoundaryParent {
        main: String,
    },
    SubProcess {
        process: String,
    },
    ThreadSplit {
        #[serde(default)]
        times: Option<String>,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        element_var: Option<String>,
        thread_start: String,
    },
    ThreadStart,
    ThreadMerge {
        split: String,
    },
}

fn default_interrupting() -> bool {
    true
}

/// How a spec with several incoming branches decides it may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Every arriving predecessor activates its own instance.
    Plain,
    /// All inputs must have completed.
    All,
    /// Every input that a live task can still reach must have completed.
    Reachable,
    /// Every thread spawned by `split` must have reported.
    Threads { split: String },
}

impl Blueprint {
    pub fn new(
        id: &str,
        name: &str,
        version: &str,
        start: &str,
        specs: Vec<TaskSpec>,
    ) -> Result<Self, StructuralError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), idx).is_some() {
                return Err(StructuralError::DuplicateSpec(spec.name.clone()));
            }
        }
        let blueprint = Self {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            start: start.to_string(),
            variables: Map::new(),
            specs,
            index,
        };
        blueprint.validate()?;
        Ok(blueprint)
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    fn validate(&self) -> Result<(), StructuralError> {
        match self.spec(&self.start).map(|s| &s.kind) {
            Some(SpecKind::Start) => {}
            _ => return Err(StructuralError::MissingStart(self.id.clone())),
        }

        for spec in &self.specs {
            for target in spec.outputs.iter().chain(spec.inputs.iter()) {
                if !self.index.contains_key(target) {
                    return Err(StructuralError::DanglingEdge {
                        from: spec.name.clone(),
                        to: target.clone(),
                    });
                }
            }

            match &spec.kind {
                SpecKind::Gateway { conditions, .. } => {
                    for branch in conditions {
                        if !spec.outputs.contains(&branch.target) {
                            return Err(StructuralError::DanglingEdge {
                                from: spec.name.clone(),
                                to: branch.target.clone(),
                            });
                        }
                    }
                }
                SpecKind::BoundaryParent { main } => {
                    if !spec.outputs.contains(main) {
                        return Err(StructuralError::DanglingEdge {
                            from: spec.name.clone(),
                            to: main.clone(),
                        });
                    }
                }
                SpecKind::ThreadSplit { times, collection, thread_start, .. } => {
                    if times.is_none() && collection.is_none() {
                        return Err(StructuralError::Invalid(format!(
                            "thread split '{}' needs 'times' or 'collection'",
                            spec.name
                        )));
                    }
                    let start = self.get(thread_start)?;
                    if !matches!(start.kind, SpecKind::ThreadStart) {
                        return Err(StructuralError::InvalidThreadStart(thread_start.clone()));
                    }
                    if start.outputs.iter().any(|o| self.can_reach(o, &spec.name)) {
                        return Err(StructuralError::CyclicThreadStart(thread_start.clone()));
                    }
                }
                SpecKind::ThreadStart => {
                    if !spec.inputs.is_empty() || spec.outputs.is_empty() {
                        return Err(StructuralError::InvalidThreadStart(spec.name.clone()));
                    }
                }
                SpecKind::ThreadMerge { split } => {
                    if !matches!(self.spec(split).map(|s| &s.kind), Some(SpecKind::ThreadSplit { .. })) {
                        return Err(StructuralError::DanglingJoin {
                            merge: spec.name.clone(),
                            split: split.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn spec(&self, name: &str) -> Option<&TaskSpec> {
        self.index.get(name).map(|&idx| &self.specs[idx])
    }

    pub fn get(&self, name: &str) -> Result<&TaskSpec, StructuralError> {
        self.spec(name).ok_or_else(|| StructuralError::MissingSpec(name.to_string()))
    }

    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    /// Specs that a task of `name` can spawn: its outputs, plus the internal
    /// thread start of a thread split.
    pub fn successors<'a>(&'a self, name: &str) -> Vec<&'a str> {
        let Some(spec) = self.spec(name) else { return Vec::new() };
        let mut out: Vec<&str> = spec.outputs.iter().map(String::as_str).collect();
        if let SpecKind::ThreadSplit { thread_start, .. } = &spec.kind {
            out.push(thread_start);
        }
        out
    }

    /// Whether a task of `from` can lead to a task of `to` (or is `to`).
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if seen.insert(current) {
                queue.extend(self.successors(current));
            }
        }
        false
    }

    pub fn join_policy(&self, name: &str) -> JoinPolicy {
        let Some(spec) = self.spec(name) else { return JoinPolicy::Plain };
        match &spec.kind {
            SpecKind::ThreadMerge { split } => JoinPolicy::Threads { split: split.clone() },
            SpecKind::Gateway { gateway, .. } if spec.inputs.len() > 1 => match gateway {
                GatewayKind::Parallel => JoinPolicy::All,
                GatewayKind::Inclusive => JoinPolicy::Reachable,
                GatewayKind::Exclusive => JoinPolicy::Plain,
            },
            _ => JoinPolicy::Plain,
        }
    }

    /// Process ids of every sub-process this blueprint calls.
    pub fn subprocesses(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().filter_map(|s| match &s.kind {
            SpecKind::SubProcess { process } => Some(process.as_str()),
            _ => None,
        })
    }
}

impl TryFrom<BlueprintDocument> for Blueprint {
    type Error = StructuralError;

    fn try_from(doc: BlueprintDocument) -> Result<Self, Self::Error> {
        Ok(Blueprint::new(&doc.id, &doc.name, &doc.version, &doc.start, doc.task_specs)?.with_variables(doc.variables))
    }
}

impl From<Blueprint> for BlueprintDocument {
    fn from(bp: Blueprint) -> Self {
        BlueprintDocument {
            id: bp.id,
            name: bp.name,
            version: bp.version,
            start: bp.start,
            variables: bp.variables,
            task_specs: bp.specs,
        }
    }
}

/// Blueprints callable as sub-processes, keyed by process id.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    blueprints: HashMap<String, Arc<Blueprint>>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, blueprint: Arc<Blueprint>) {
        self.blueprints.insert(blueprint.id.clone(), blueprint);
    }

    pub fn with(mut self, blueprint: Blueprint) -> Self {
        self.register(Arc::new(blueprint));
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Blueprint>> {
        self.blueprints.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Blueprint>)> {
        self.blueprints.iter()
    }

    /// Checks that every sub-process reachable from `root` is registered.
    pub fn check(&self, root: &Blueprint) -> Result<(), StructuralError> {
        let mut pending: Vec<&Blueprint> = vec![root];
        let mut seen = HashSet::new();
        while let Some(bp) = pending.pop() {
            for id in bp.subprocesses() {
                let sub = self
                    .get(id)
                    .ok_or_else(|| StructuralError::UnknownSubprocess(id.to_string()))?;
                if seen.insert(id.to_string()) {
                    pending.push(sub);
                }
            }
        }
        Ok(())
    }
}
