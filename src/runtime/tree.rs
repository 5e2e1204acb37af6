use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::runtime::blueprint::{Blueprint, SpecKind};
use crate::runtime::task::{Task, TaskState, ThreadId};
use crate::util::{merge_maps, MergeMode};

/// Arena of the task instances of one process run. Parent and child links
/// are ids into the arena; a task is dropped together with its subtree.
#[derive(Debug, Clone)]
pub struct TaskTree {
    pub blueprint: Arc<Blueprint>,
    pub root: Uuid,
    /// Data the run was started with.
    pub data: Map<String, Value>,
    tasks: BTreeMap<Uuid, Task>,
}

impl TaskTree {
    /// A fresh tree holding a FUTURE task for the blueprint's start spec.
    pub fn new(blueprint: Arc<Blueprint>, data: Map<String, Value>) -> Self {
        let mut root = Task::new(&blueprint.start, None, TaskState::Future, 0);
        root.data = data.clone();
        let id = root.id;
        Self {
            blueprint,
            root: id,
            data,
            tasks: BTreeMap::from([(id, root)]),
        }
    }

    /// Reassembles a stored tree, checking that every link resolves.
    pub fn from_parts(
        blueprint: Arc<Blueprint>,
        root: Uuid,
        data: Map<String, Value>,
        tasks: BTreeMap<Uuid, Task>,
    ) -> Result<Self> {
        if !tasks.contains_key(&root) {
            return Err(WorkflowError::Snapshot(format!("root task {} is missing", root)));
        }
        for task in tasks.values() {
            blueprint.get(&task.spec)?;
            if let Some(parent) = task.parent {
                let linked = tasks.get(&parent).is_some_and(|p| p.children.contains(&task.id));
                if !linked {
                    return Err(WorkflowError::Snapshot(format!(
                        "task {} is not a child of its parent {}",
                        task.id, parent
                    )));
                }
            } else if task.id != root {
                return Err(WorkflowError::Snapshot(format!("task {} has no parent", task.id)));
            }
            if let Some(child) = task.children.iter().find(|c| !tasks.contains_key(c)) {
                return Err(WorkflowError::Snapshot(format!(
                    "task {} lists missing child {}",
                    task.id, child
                )));
            }
        }
        Ok(Self { blueprint, root, data, tasks })
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn task(&self, id: Uuid) -> Result<&Task> {
        self.tasks.get(&id).ok_or(WorkflowError::TaskNotFound(id))
    }

    pub fn task_mut(&mut self, id: Uuid) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(WorkflowError::TaskNotFound(id))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn tasks(&self) -> &BTreeMap<Uuid, Task> {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task ids in depth-first tree order.
    pub fn walk(&self) -> Vec<Uuid> {
        self.walk_from(self.root)
    }

    pub fn walk_from(&self, start: Uuid) -> Vec<Uuid> {
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(task) = self.tasks.get(&id) else { continue };
            order.push(id);
            stack.extend(task.children.iter().rev());
        }
        order
    }

    /// Every task below `id`, not including `id` itself.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut all = self.walk_from(id);
        if !all.is_empty() {
            all.remove(0);
        }
        all
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.tasks.get(&id).and_then(|t| t.parent);
        while let Some(parent) = current {
            if !seen.insert(parent) {
                break;
            }
            out.push(parent);
            current = self.tasks.get(&parent).and_then(|t| t.parent);
        }
        out
    }

    pub fn insert_child(
        &mut self,
        parent: Uuid,
        spec: &str,
        state: TaskState,
        data: Map<String, Value>,
        thread_id: ThreadId,
    ) -> Uuid {
        let mut child = Task::new(spec, Some(parent), state, thread_id);
        child.data = data;
        let id = child.id;
        self.tasks.insert(id, child);
        if let Some(p) = self.tasks.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    /// Drops the subtree under `id` (keeping `id`). Returns the removed ids.
    pub fn remove_children(&mut self, id: Uuid) -> Vec<Uuid> {
        let removed = self.descendants(id);
        for gone in &removed {
            self.tasks.remove(gone);
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.children.clear();
        }
        removed
    }

    /// Drops `id` and everything below it. Returns the removed ids.
    pub fn remove_subtree(&mut self, id: Uuid) -> Vec<Uuid> {
        let removed = self.walk_from(id);
        let parent = self.tasks.get(&id).and_then(|t| t.parent);
        for gone in &removed {
            self.tasks.remove(gone);
        }
        if let Some(p) = parent.and_then(|p| self.tasks.get_mut(&p)) {
            p.children.retain(|c| *c != id);
        }
        removed
    }

    pub fn spec_kind(&self, id: Uuid) -> Option<&SpecKind> {
        let task = self.tasks.get(&id)?;
        self.blueprint.spec(&task.spec).map(|s| &s.kind)
    }

    /// Merged data of every completed end task, in tree order.
    pub fn result_data(&self) -> Map<String, Value> {
        let mut result = Map::new();
        for id in self.walk() {
            let Some(task) = self.tasks.get(&id) else { continue };
            let is_end = matches!(self.spec_kind(id), Some(SpecKind::End { .. }));
            if is_end && task.state == TaskState::Completed {
                merge_maps(&mut result, &task.data, MergeMode::Keep);
            }
        }
        result
    }
}
