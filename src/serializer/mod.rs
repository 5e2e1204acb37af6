//! Snapshots of running workflows.
//!
//! [`serialize`] always writes the current version. [`deserialize`] accepts
//! any version the migration registry knows and upgrades it on the way in.

pub mod migration;
pub mod snapshot;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::{Result, StructuralError};
use crate::runtime::blueprint::SpecRegistry;
use crate::runtime::engine::Workflow;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::tree::TaskTree;

pub use migration::{migrate, version_of, CURRENT_VERSION};
pub use snapshot::{Snapshot, SubprocessSnapshot};

pub fn to_snapshot(workflow: &Workflow) -> Snapshot {
    let top = workflow.top();
    Snapshot {
        serializer_version: CURRENT_VERSION.to_string(),
        spec: (*top.blueprint).clone(),
        subprocess_specs: workflow
            .registry()
            .iter()
            .map(|(id, bp)| (id.clone(), (**bp).clone()))
            .collect(),
        generation: workflow.generation(),
        next_thread_id: workflow.next_thread_id(),
        root: top.root,
        data: top.data.clone(),
        tasks: top.tasks().clone(),
        subprocesses: workflow
            .subprocesses()
            .iter()
            .map(|(owner, tree)| {
                let sub = SubprocessSnapshot {
                    spec: tree.blueprint.id.clone(),
                    root: tree.root,
                    data: tree.data.clone(),
                    tasks: tree.tasks().clone(),
                };
                (*owner, sub)
            })
            .collect(),
    }
}

pub fn serialize(workflow: &Workflow) -> Result<Value> {
    Ok(serde_json::to_value(to_snapshot(workflow))?)
}

/// Rebuilds a workflow, migrating older snapshots first. The input is left
/// untouched when migration fails.
pub fn deserialize(snapshot: Value, evaluator: Arc<dyn Evaluator>) -> Result<Workflow> {
    let version = version_of(&snapshot)?;
    let snapshot = if version == CURRENT_VERSION {
        snapshot
    } else {
        let migrated = migrate(&snapshot)?;
        info!(from = %version, to = CURRENT_VERSION, "snapshot migrated");
        migrated
    };
    let snapshot: Snapshot = serde_json::from_value(snapshot)?;
    from_snapshot(snapshot, evaluator)
}

pub fn from_snapshot(snapshot: Snapshot, evaluator: Arc<dyn Evaluator>) -> Result<Workflow> {
    let mut registry = SpecRegistry::new();
    for (_, blueprint) in snapshot.subprocess_specs {
        registry.register(Arc::new(blueprint));
    }
    let blueprint = Arc::new(snapshot.spec);
    registry.check(&blueprint)?;

    let top = TaskTree::from_parts(blueprint, snapshot.root, snapshot.data, snapshot.tasks)?;
    let mut subprocesses = BTreeMap::new();
    for (owner, sub) in snapshot.subprocesses {
        let blueprint = registry
            .get(&sub.spec)
            .cloned()
            .ok_or_else(|| StructuralError::UnknownSubprocess(sub.spec.clone()))?;
        let tree = TaskTree::from_parts(blueprint, sub.root, sub.data, sub.tasks)?;
        subprocesses.insert(owner, tree);
    }

    Workflow::from_parts(
        top,
        subprocesses,
        registry,
        evaluator,
        snapshot.next_thread_id,
        snapshot.generation,
    )
}
