use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::WorkflowError;
use crate::runtime::engine::Workflow;
use crate::runtime::evaluator::Evaluator;
use crate::serializer;

// --- Interfaces ---

/// Persists workflow snapshots under a caller-chosen key.
///
/// `save` is a compare-and-swap on the snapshot generation: it only succeeds
/// while the stored generation is still `expected` (`None` meaning nothing is
/// stored yet) and reports [`WorkflowError::ConcurrentMutation`] otherwise.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Value>>;
    async fn save(&self, key: &str, snapshot: Value, expected: Option<u64>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub(crate) fn snapshot_generation(snapshot: &Value) -> u64 {
    snapshot.get("generation").and_then(Value::as_u64).unwrap_or(0)
}

/// Serializes `workflow` and stores it, expecting `expected` to be the
/// generation currently stored.
pub async fn persist(
    store: &dyn SnapshotStore,
    key: &str,
    workflow: &Workflow,
    expected: Option<u64>,
) -> Result<()> {
    let snapshot = serializer::serialize(workflow)?;
    store.save(key, snapshot, expected).await
}

/// Loads and (if needed) migrates the snapshot stored under `key`.
pub async fn restore(store: &dyn SnapshotStore, key: &str, evaluator: Arc<dyn Evaluator>) -> Result<Option<Workflow>> {
    let Some(snapshot) = store.load(key).await? else { return Ok(None) };
    let workflow = serializer::deserialize(snapshot, evaluator)
        .with_context(|| format!("failed to restore workflow '{}'", key))?;
    Ok(Some(workflow))
}

// --- In-Memory Implementation ---

#[derive(Default)]
pub struct InMemorySnapshotStore {
    // key -> (generation, snapshot)
    snapshots: DashMap<String, (u64, Value)>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.snapshots.get(key).map(|entry| entry.value().1.clone()))
    }

    async fn save(&self, key: &str, snapshot: Value, expected: Option<u64>) -> Result<()> {
        let generation = snapshot_generation(&snapshot);
        // The entry guard holds the shard lock, so check and write are atomic.
        match self.snapshots.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let found = slot.get().0;
                if expected != Some(found) {
                    return Err(WorkflowError::ConcurrentMutation {
                        key: key.to_string(),
                        expected: expected.unwrap_or(0),
                        found,
                    }
                    .into());
                }
                slot.insert((generation, snapshot));
            }
            Entry::Vacant(slot) => {
                if let Some(expected) = expected {
                    return Err(WorkflowError::ConcurrentMutation {
                        key: key.to_string(),
                        expected,
                        found: 0,
                    }
                    .into());
                }
                slot.insert((generation, snapshot));
            }
        }
        debug!(key, generation, "snapshot saved");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.snapshots.remove(key);
        Ok(())
    }
}
