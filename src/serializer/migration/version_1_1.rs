//! 1.0 -> 1.1: sub-process trees move out of the caller's task map.
//!
//! A 1.0 snapshot keeps every task in one map and tags each task with the
//! `workflow` (process id) it belongs to; sub-process blueprints are nested
//! inside the calling blueprint under `subprocess_specs`. From 1.1 on each
//! child tree lives in `subprocesses[<calling task>]` and every blueprint is
//! registered in the top-level `subprocess_specs`.

use std::collections::{BTreeMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::debug;

use super::{as_object, malformed};
use crate::error::MigrationError;
use crate::util::{merge, MergeMode};

const VERSION: &str = "1.0";
// 1.0 codes: COMPLETED = 32, CANCELLED = 64.
const FINISHED_CODES: [u64; 2] = [32, 64];
const WAITING: u64 = 8;

pub fn migrate(mut snapshot: Value) -> Result<Value, MigrationError> {
    let root = as_object(&mut snapshot, VERSION, "snapshot")?;

    let mut specs = Map::new();
    if let Some(spec) = root.get_mut("spec") {
        collect_specs(spec, &mut specs);
    }

    let mut tasks = match root.remove("tasks") {
        Some(Value::Object(tasks)) => tasks,
        _ => return Err(malformed(VERSION, "missing task map")),
    };

    // A task whose process differs from its parent's starts a child tree.
    let mut sub_roots: Vec<(String, String)> = Vec::new();
    for (id, task) in &tasks {
        let Some(parent) = task.get("parent").and_then(Value::as_str) else { continue };
        let owner = tasks
            .get(parent)
            .ok_or_else(|| malformed(VERSION, format!("task {} has a missing parent", id)))?;
        if workflow_of(task) != workflow_of(owner) {
            sub_roots.push((id.clone(), parent.to_string()));
        }
    }

    for (sub_root, owner) in &sub_roots {
        let owner_task = tasks
            .get_mut(owner.as_str())
            .ok_or_else(|| malformed(VERSION, format!("owner {} is missing", owner)))?;
        let finished = owner_task
            .get("state")
            .and_then(Value::as_u64)
            .is_some_and(|code| FINISHED_CODES.contains(&code));
        if let Some(Value::Array(children)) = owner_task.get_mut("children") {
            children.retain(|c| c.as_str() != Some(sub_root.as_str()));
        }
        if !finished {
            merge(owner_task, &json!({ "state": WAITING }), MergeMode::Keep);
        }
        if let Some(root_task) = tasks.get_mut(sub_root.as_str()) {
            merge(root_task, &json!({ "parent": null }), MergeMode::Keep);
        }
    }

    let boundaries: HashSet<&str> = sub_roots.iter().map(|(id, _)| id.as_str()).collect();
    let mut subprocesses = BTreeMap::new();
    for (sub_root, owner) in &sub_roots {
        let process = tasks
            .get(sub_root.as_str())
            .and_then(workflow_of)
            .ok_or_else(|| malformed(VERSION, format!("task {} has no workflow tag", sub_root)))?
            .to_string();
        let data = tasks
            .get(sub_root.as_str())
            .and_then(|t| t.get("data"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        let mut moved = Map::new();
        let mut stack = vec![sub_root.clone()];
        while let Some(id) = stack.pop() {
            let Some(task) = tasks.remove(&id) else { continue };
            let children = task.get("children").and_then(Value::as_array).into_iter().flatten();
            for child in children.filter_map(Value::as_str) {
                if !boundaries.contains(child) {
                    stack.push(child.to_string());
                }
            }
            moved.insert(id, task);
        }

        debug!(owner = %owner, process = %process, tasks = moved.len(), "relocating sub-process tree");
        subprocesses.insert(
            owner.clone(),
            json!({ "spec": process, "root": sub_root, "data": data, "tasks": moved }),
        );
    }

    strip_workflow_tags(&mut tasks);
    for sub in subprocesses.values_mut() {
        if let Some(Value::Object(sub_tasks)) = sub.get_mut("tasks") {
            strip_workflow_tags(sub_tasks);
        }
    }

    root.insert("tasks".to_string(), Value::Object(tasks));
    root.insert("subprocesses".to_string(), Value::Object(subprocesses.into_iter().collect()));
    root.insert("subprocess_specs".to_string(), Value::Object(specs));
    Ok(snapshot)
}

fn workflow_of(task: &Value) -> Option<&str> {
    task.get("workflow").and_then(Value::as_str)
}

/// Lifts nested sub-process blueprints out of `spec`, depth first.
fn collect_specs(spec: &mut Value, out: &mut Map<String, Value>) {
    let Some(Value::Object(nested)) = spec.as_object_mut().and_then(|s| s.remove("subprocess_specs")) else {
        return;
    };
    for (id, mut child) in nested {
        collect_specs(&mut child, out);
        out.insert(id, child);
    }
}

fn strip_workflow_tags(tasks: &mut Map<String, Value>) {
    for task in tasks.values_mut() {
        if let Value::Object(task) = task {
            task.remove("workflow");
        }
    }
}
