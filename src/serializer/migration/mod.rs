//! Upgrades stored snapshots one serializer version at a time.
//!
//! Each step is a pure function from a snapshot at one version to the next.
//! Steps run in registry order from the snapshot's version; none is skipped.

pub mod version_1_1;
pub mod version_1_2;
pub mod version_1_3;

use serde_json::{Map, Value};
use tracing::info;

use crate::error::MigrationError;

pub const CURRENT_VERSION: &str = "1.3";

pub type MigrationStep = fn(Value) -> Result<Value, MigrationError>;

/// `(from, to, step)`, oldest first.
pub const MIGRATIONS: &[(&str, &str, MigrationStep)] = &[
    ("1.0", "1.1", version_1_1::migrate),
    ("1.1", "1.2", version_1_2::migrate),
    ("1.2", "1.3", version_1_3::migrate),
];

pub fn version_of(snapshot: &Value) -> Result<String, MigrationError> {
    snapshot
        .get("serializer_version")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MigrationError::Malformed {
            version: "?".to_string(),
            reason: "missing serializer_version".to_string(),
        })
}

/// Brings a copy of `snapshot` up to [`CURRENT_VERSION`].
pub fn migrate(snapshot: &Value) -> Result<Value, MigrationError> {
    let version = version_of(snapshot)?;
    if version == CURRENT_VERSION {
        return Ok(snapshot.clone());
    }
    let start = MIGRATIONS
        .iter()
        .position(|(from, _, _)| *from == version)
        .ok_or_else(|| {
            if is_newer(&version, CURRENT_VERSION) {
                MigrationError::NewerVersion {
                    found: version.clone(),
                    current: CURRENT_VERSION.to_string(),
                }
            } else {
                MigrationError::UnknownVersion(version.clone())
            }
        })?;

    let mut current = snapshot.clone();
    for (from, to, step) in &MIGRATIONS[start..] {
        info!(from, to, "applying snapshot migration");
        current = step(current)?;
        if let Value::Object(map) = &mut current {
            map.insert("serializer_version".to_string(), Value::String(to.to_string()));
        }
    }
    Ok(current)
}

/// Compares dotted versions part by part, numerically where both parts are
/// numbers: `1.10` is newer than `1.3`.
fn is_newer(version: &str, than: &str) -> bool {
    let mut ours = version.split('.');
    let mut theirs = than.split('.');
    loop {
        match (ours.next(), theirs.next()) {
            (None, _) => return false,
            (Some(_), None) => return true,
            (Some(a), Some(b)) => {
                let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(a), Ok(b)) => a.cmp(&b),
                    _ => a.cmp(b),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering.is_gt();
                }
            }
        }
    }
}

pub(crate) fn malformed(version: &str, reason: impl Into<String>) -> MigrationError {
    MigrationError::Malformed {
        version: version.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn as_object<'a>(value: &'a mut Value, version: &str, what: &str) -> Result<&'a mut Map<String, Value>, MigrationError> {
    value
        .as_object_mut()
        .ok_or_else(|| malformed(version, format!("{} is not an object", what)))
}

/// Every task map of the snapshot: the top tree and each sub-process tree.
pub(crate) fn for_each_task(
    snapshot: &mut Value,
    mut f: impl FnMut(&mut Map<String, Value>) -> Result<(), MigrationError>,
) -> Result<(), MigrationError> {
    let mut visit = |tasks: Option<&mut Value>| -> Result<(), MigrationError> {
        let Some(Value::Object(tasks)) = tasks else { return Ok(()) };
        for task in tasks.values_mut() {
            if let Value::Object(task) = task {
                f(task)?;
            }
        }
        Ok(())
    };
    visit(snapshot.get_mut("tasks"))?;
    if let Some(Value::Object(subs)) = snapshot.get_mut("subprocesses") {
        for sub in subs.values_mut() {
            visit(sub.get_mut("tasks"))?;
        }
    }
    Ok(())
}

/// Every task spec of the main blueprint and of each sub-process blueprint.
pub(crate) fn for_each_spec(
    snapshot: &mut Value,
    mut f: impl FnMut(&mut Map<String, Value>) -> Result<(), MigrationError>,
) -> Result<(), MigrationError> {
    let mut visit = |blueprint: Option<&mut Value>| -> Result<(), MigrationError> {
        let Some(Value::Array(specs)) = blueprint.and_then(|bp| bp.get_mut("task_specs")) else {
            return Ok(());
        };
        for spec in specs.iter_mut() {
            if let Value::Object(spec) = spec {
                f(spec)?;
            }
        }
        Ok(())
    };
    visit(snapshot.get_mut("spec"))?;
    if let Some(Value::Object(specs)) = snapshot.get_mut("subprocess_specs") {
        for blueprint in specs.values_mut() {
            visit(Some(blueprint))?;
        }
    }
    Ok(())
}
