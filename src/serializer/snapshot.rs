use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::runtime::blueprint::Blueprint;
use crate::runtime::task::Task;

/// The stored form of a workflow at the current serializer version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub serializer_version: String,
    pub spec: Blueprint,
    #[serde(default)]
    pub subprocess_specs: BTreeMap<String, Blueprint>,
    #[serde(default)]
    pub generation: u64,
    #[serde(default = "first_thread")]
    pub next_thread_id: u64,
    pub root: Uuid,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub tasks: BTreeMap<Uuid, Task>,
    /// Child process trees keyed by the task that called them.
    #[serde(default)]
    pub subprocesses: BTreeMap<Uuid, SubprocessSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessSnapshot {
    /// Process id of the child blueprint.
    pub spec: String,
    pub root: Uuid,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub tasks: BTreeMap<Uuid, Task>,
}

fn first_thread() -> u64 {
    1
}
