use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StructuralError, WorkflowError};
use crate::events::timer::TIMER_SLOT;
use crate::events::{record_catch, Event, EventKind, DESCRIPTOR_SLOT};
use crate::nodes::{subprocess, thread};
use crate::runtime::blueprint::{Blueprint, JoinPolicy, SpecKind, SpecRegistry, TaskSpec};
use crate::runtime::evaluator::Evaluator;
use crate::runtime::node::{self, Entry, Step};
use crate::runtime::task::{StateMask, Task, TaskFilter, TaskState, ThreadId};
use crate::runtime::tree::TaskTree;
use crate::util::{merge_maps, MergeMode};

/// Which tree of a workflow a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TreeKey {
    Top,
    /// The child process owned by this task.
    Sub(Uuid),
}

/// One running process instance: the top-level task tree plus one tree per
/// sub-process call, keyed by the calling task.
///
/// Every mutating call bumps [`Workflow::generation`], which snapshot stores
/// use to detect interleaved writers.
#[derive(Debug)]
pub struct Workflow {
    top: TaskTree,
    subprocesses: BTreeMap<Uuid, TaskTree>,
    registry: SpecRegistry,
    evaluator: Arc<dyn Evaluator>,
    next_thread_id: ThreadId,
    generation: u64,
    outbox: Vec<Event>,
}

impl Workflow {
    pub fn new(blueprint: Arc<Blueprint>, registry: SpecRegistry, evaluator: Arc<dyn Evaluator>) -> Result<Self> {
        registry.check(&blueprint)?;
        let variables = blueprint.variables.clone();
        let top = TaskTree::new(blueprint, variables);
        let root = top.root;
        let mut workflow = Self {
            top,
            subprocesses: BTreeMap::new(),
            registry,
            evaluator,
            next_thread_id: 1,
            generation: 0,
            outbox: Vec::new(),
        };
        workflow.activate(TreeKey::Top, root)?;
        info!(process = %workflow.top.blueprint.id, root = %root, "workflow created");
        Ok(workflow)
    }

    /// Seeds the run's initial data.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        merge_maps(&mut self.top.data, &data, MergeMode::Keep);
        let root = self.top.root;
        if let Some(task) = self.top.get_mut(root) {
            merge_maps(&mut task.data, &data, MergeMode::Keep);
        }
        self
    }

    pub(crate) fn from_parts(
        top: TaskTree,
        subprocesses: BTreeMap<Uuid, TaskTree>,
        registry: SpecRegistry,
        evaluator: Arc<dyn Evaluator>,
        next_thread_id: ThreadId,
        generation: u64,
    ) -> Result<Self> {
        let workflow = Self {
            top,
            subprocesses,
            registry,
            evaluator,
            next_thread_id,
            generation,
            outbox: Vec::new(),
        };
        for owner in workflow.subprocesses.keys() {
            let owned = workflow.top.contains(*owner)
                || workflow.subprocesses.values().any(|tree| tree.contains(*owner));
            if !owned {
                return Err(WorkflowError::Snapshot(format!(
                    "sub-process owner {} is not a task of this workflow",
                    owner
                )));
            }
        }
        Ok(workflow)
    }

    pub fn blueprint(&self) -> &Arc<Blueprint> {
        &self.top.blueprint
    }

    pub fn top(&self) -> &TaskTree {
        &self.top
    }

    pub fn subprocesses(&self) -> &BTreeMap<Uuid, TaskTree> {
        &self.subprocesses
    }

    pub fn registry(&self) -> &SpecRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }

    pub fn next_thread_id(&self) -> ThreadId {
        self.next_thread_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get_task(&self, id: Uuid) -> Option<&Task> {
        let key = self.locate(id)?;
        self.tree(key).ok()?.get(id)
    }

    /// Tasks of every tree matching `filter`, in tree order. A sub-process
    /// tree follows the task that owns it.
    pub fn get_tasks<'a>(&self, filter: impl Into<TaskFilter<'a>>) -> Vec<&Task> {
        let filter = filter.into();
        self.walk_all()
            .into_iter()
            .filter_map(|(key, id)| self.tree(key).ok()?.get(id))
            .filter(|task| filter.matches(task))
            .collect()
    }

    pub fn ready_tasks(&self) -> Vec<Uuid> {
        self.get_tasks(TaskState::Ready).into_iter().map(|t| t.id).collect()
    }

    /// True once no task of the top-level tree is unfinished.
    pub fn is_completed(&self) -> bool {
        !self
            .top
            .tasks()
            .values()
            .any(|t| t.has_state(StateMask::NOT_FINISHED))
    }

    /// Result data of the run: the merged data of its completed end tasks.
    pub fn data(&self) -> Map<String, Value> {
        self.top.result_data()
    }

    /// Events thrown by tasks since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.outbox)
    }

    /// Runs ready tasks until none is left. Returns how many ran.
    pub fn advance_ready_tasks(&mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            let ready = self.ready_tasks();
            if ready.is_empty() {
                return Ok(count);
            }
            for id in ready {
                if self.get_task(id).is_some_and(|t| t.state == TaskState::Ready) {
                    self.advance(id)?;
                    count += 1;
                }
            }
        }
    }

    /// Runs one READY task.
    pub fn advance(&mut self, id: Uuid) -> Result<()> {
        let key = self.locate(id).ok_or(WorkflowError::TaskNotFound(id))?;
        let outcome = self.run_task(key, id);
        self.generation += 1;
        let settled = self.settle();
        outcome.and(settled)
    }

    /// Submits a STARTED task, merging `data` into it.
    pub fn complete_task(&mut self, id: Uuid, data: Map<String, Value>) -> Result<()> {
        let key = self.locate(id).ok_or(WorkflowError::TaskNotFound(id))?;
        let outputs = {
            let tree = self.tree_mut(key)?;
            let blueprint = tree.blueprint.clone();
            let task = tree.task_mut(id)?;
            if task.state != TaskState::Started {
                return Err(WorkflowError::InvalidState {
                    task_id: id,
                    actual: task.state,
                    expected: TaskState::Started,
                });
            }
            merge_maps(&mut task.data, &data, MergeMode::Keep);
            blueprint.get(&task.spec)?.outputs.clone()
        };
        self.complete(key, id, &outputs)?;
        self.generation += 1;
        self.settle()
    }

    /// Delivers an event from outside the workflow. Returns how many waiting
    /// tasks caught it; an event nobody waits for is dropped.
    pub fn throw(&mut self, event: Event) -> Result<usize> {
        let caught = if event.kind == EventKind::Terminate {
            info!("workflow terminated");
            self.cancel_tree(TreeKey::Top)?;
            0
        } else {
            self.catch(&event)?
        };
        self.generation += 1;
        self.settle()?;
        Ok(caught)
    }

    /// Earliest deadline among the waiting timers.
    pub fn earliest_timer(&self) -> Option<DateTime<Utc>> {
        self.get_tasks(TaskState::Waiting)
            .into_iter()
            .filter_map(timer_deadline)
            .min()
    }

    /// Makes every waiting timer whose deadline is at or before `now` READY.
    pub fn refresh_waiting_tasks(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for (key, id) in self.walk_all() {
            let task = self.tree_mut(key)?.task_mut(id)?;
            if task.state != TaskState::Waiting {
                continue;
            }
            match timer_deadline(task) {
                Some(at) if at <= now => {
                    task.internal_data.remove(TIMER_SLOT);
                    task.set_state(TaskState::Ready);
                    info!(task_id = %id, spec = %task.spec, deadline = %at, "timer fired");
                    fired += 1;
                }
                _ => {}
            }
        }
        if fired > 0 {
            self.generation += 1;
            self.settle()?;
        }
        Ok(fired)
    }

    /// Discards everything below `id` and replays it from its parent's data.
    pub fn reset_to_task(&mut self, id: Uuid) -> Result<()> {
        let key = self.locate(id).ok_or(WorkflowError::TaskNotFound(id))?;
        let (removed, parent_done) = {
            let tree = self.tree_mut(key)?;
            let parent = tree.task(id)?.parent;
            let removed = tree.remove_children(id);
            let (data, parent_done) = match parent {
                Some(p) => {
                    let p = tree.task(p)?;
                    (p.data.clone(), p.state == TaskState::Completed)
                }
                None => (tree.data.clone(), true),
            };
            let task = tree.task_mut(id)?;
            task.data = data;
            task.internal_data.clear();
            task.set_state(TaskState::Future);
            (removed, parent_done)
        };
        self.drop_subprocess(id);
        for gone in removed {
            self.drop_subprocess(gone);
        }
        info!(task_id = %id, "task reset");
        if parent_done {
            self.activate(key, id)?;
        }
        self.generation += 1;
        self.settle()
    }

    /// Cancels every unfinished task of the workflow.
    pub fn cancel(&mut self) -> Result<()> {
        self.cancel_tree(TreeKey::Top)?;
        self.generation += 1;
        info!(process = %self.top.blueprint.id, "workflow cancelled");
        Ok(())
    }

    /// Cancels one task together with everything below it.
    pub fn cancel_task(&mut self, id: Uuid) -> Result<()> {
        let key = self.locate(id).ok_or(WorkflowError::TaskNotFound(id))?;
        self.cancel_subtree(key, id)?;
        self.generation += 1;
        self.settle()
    }

    pub(crate) fn tree(&self, key: TreeKey) -> Result<&TaskTree> {
        match key {
            TreeKey::Top => Ok(&self.top),
            TreeKey::Sub(owner) => self.subprocesses.get(&owner).ok_or(WorkflowError::TaskNotFound(owner)),
        }
    }

    fn tree_mut(&mut self, key: TreeKey) -> Result<&mut TaskTree> {
        match key {
            TreeKey::Top => Ok(&mut self.top),
            TreeKey::Sub(owner) => self
                .subprocesses
                .get_mut(&owner)
                .ok_or(WorkflowError::TaskNotFound(owner)),
        }
    }

    fn locate(&self, id: Uuid) -> Option<TreeKey> {
        if self.top.contains(id) {
            return Some(TreeKey::Top);
        }
        self.subprocesses
            .iter()
            .find(|(_, tree)| tree.contains(id))
            .map(|(owner, _)| TreeKey::Sub(*owner))
    }

    /// Every task of every tree, depth first.
    pub(crate) fn walk_all(&self) -> Vec<(TreeKey, Uuid)> {
        let mut out = Vec::new();
        self.collect(TreeKey::Top, &mut out);
        out
    }

    fn collect(&self, key: TreeKey, out: &mut Vec<(TreeKey, Uuid)>) {
        let Ok(tree) = self.tree(key) else { return };
        for id in tree.walk() {
            out.push((key, id));
            if self.subprocesses.contains_key(&id) {
                self.collect(TreeKey::Sub(id), out);
            }
        }
    }

    /// A predecessor activated `id`: joins record an arrival, everything else
    /// becomes READY or WAITING.
    fn activate(&mut self, key: TreeKey, id: Uuid) -> Result<()> {
        let blueprint = self.tree(key)?.blueprint.clone();
        let spec_name = self.tree(key)?.task(id)?.spec.clone();
        let spec = blueprint.get(&spec_name)?;
        match blueprint.join_policy(&spec_name) {
            JoinPolicy::Plain => self.enter(key, id, spec),
            policy => {
                self.tree_mut(key)?.task_mut(id)?.set_state(TaskState::Waiting);
                debug!(task_id = %id, spec = %spec_name, "join arrival");
                self.try_join(key, id, &policy).map(|_| ())
            }
        }
    }

    fn enter(&mut self, key: TreeKey, id: Uuid, spec: &TaskSpec) -> Result<()> {
        let evaluator = self.evaluator.clone();
        let (entry, data) = {
            let task = self.tree_mut(key)?.task_mut(id)?;
            match node::enter(spec, task, evaluator.as_ref()) {
                Ok(entry) => (entry, task.data.clone()),
                Err(source) => {
                    task.set_state(TaskState::Error);
                    warn!(task_id = %id, spec = %spec.name, error = %source, "task failed to enter");
                    return Err(WorkflowError::Task { task_id: id, spec: spec.name.clone(), source });
                }
            }
        };
        match entry {
            Entry::Ready => self.tree_mut(key)?.task_mut(id)?.set_state(TaskState::Ready),
            Entry::Wait => self.tree_mut(key)?.task_mut(id)?.set_state(TaskState::Waiting),
            Entry::SubProcess(process) => {
                let blueprint = self
                    .registry
                    .get(&process)
                    .cloned()
                    .ok_or_else(|| StructuralError::UnknownSubprocess(process.clone()))?;
                self.tree_mut(key)?.task_mut(id)?.set_state(TaskState::Waiting);
                self.drop_subprocess(id);
                // The caller's data wins over the child's declared defaults.
                let mut seeded = blueprint.variables.clone();
                merge_maps(&mut seeded, &data, MergeMode::Keep);
                let child = TaskTree::new(blueprint, seeded);
                let root = child.root;
                self.subprocesses.insert(id, child);
                info!(task_id = %id, process = %process, "sub-process started");
                self.activate(TreeKey::Sub(id), root)?;
            }
        }
        Ok(())
    }

    fn run_task(&mut self, key: TreeKey, id: Uuid) -> Result<()> {
        let blueprint = self.tree(key)?.blueprint.clone();
        let spec = {
            let task = self.tree(key)?.task(id)?;
            if task.state != TaskState::Ready {
                return Err(WorkflowError::InvalidState {
                    task_id: id,
                    actual: task.state,
                    expected: TaskState::Ready,
                });
            }
            blueprint.get(&task.spec)?
        };

        if matches!(spec.kind, SpecKind::SubProcess { .. }) {
            let result = self.subprocesses.get(&id).map(TaskTree::result_data);
            if let Some(result) = result {
                subprocess::absorb(self.tree_mut(key)?.task_mut(id)?, &result);
            }
        }

        let evaluator = self.evaluator.clone();
        let step = {
            let task = self.tree_mut(key)?.task_mut(id)?;
            match node::run(spec, task, evaluator.as_ref()) {
                Ok(step) => step,
                Err(source) => {
                    task.set_state(TaskState::Error);
                    warn!(task_id = %id, spec = %spec.name, error = %source, "task failed");
                    return Err(WorkflowError::Task { task_id: id, spec: spec.name.clone(), source });
                }
            }
        };
        debug!(task_id = %id, spec = %spec.name, "task ran");

        match step {
            Step::Suspend => {
                self.tree_mut(key)?.task_mut(id)?.set_state(TaskState::Started);
                Ok(())
            }
            Step::Jump(targets) => self.complete(key, id, &targets),
            Step::Throw(event, targets) => {
                self.complete(key, id, &targets)?;
                self.outbox.push(event.clone());
                self.dispatch(key, &event)
            }
            Step::Fork(seeds) => self.fork(key, id, spec, seeds),
            Step::NewThread => self.new_thread(key, id, spec),
        }
    }

    fn complete(&mut self, key: TreeKey, id: Uuid, activate: &[String]) -> Result<()> {
        self.tree_mut(key)?.task_mut(id)?.set_state(TaskState::Completed);
        self.resolve_boundaries(key, id)?;
        self.sync_children(key, id, activate)
    }

    /// An interrupting boundary catcher cancels the task it is attached to;
    /// a main task that finishes cancels its pending boundary catchers.
    fn resolve_boundaries(&mut self, key: TreeKey, id: Uuid) -> Result<()> {
        let tree = self.tree(key)?;
        let task = tree.task(id)?;
        let Some(parent) = task.parent else { return Ok(()) };
        let Some(SpecKind::BoundaryParent { main }) = tree.spec_kind(parent) else { return Ok(()) };

        let interrupting = matches!(tree.spec_kind(id), Some(SpecKind::Boundary { interrupting: true, .. }));
        let is_main = task.spec == *main;
        if !interrupting && !is_main {
            return Ok(());
        }
        let siblings: Vec<Uuid> = tree
            .task(parent)?
            .children
            .iter()
            .copied()
            .filter(|s| *s != id)
            .filter(|s| is_main || tree.get(*s).is_some_and(|t| !t.state.is_finished()))
            .collect();
        if interrupting {
            info!(task_id = %id, spec = %task.spec, "boundary event interrupted its task");
        }
        for sibling in siblings {
            let unfinished = self.tree(key)?.get(sibling).is_some_and(|t| !t.state.is_finished());
            if unfinished {
                self.cancel_subtree(key, sibling)?;
            }
        }
        Ok(())
    }

    /// Creates a FUTURE child for every output that has none, drops predicted
    /// children whose spec is no longer an output, then activates the
    /// children named in `activate`.
    fn sync_children(&mut self, key: TreeKey, id: Uuid, activate: &[String]) -> Result<()> {
        let tree = self.tree_mut(key)?;
        let blueprint = tree.blueprint.clone();
        let task = tree.task(id)?;
        let outputs = &blueprint.get(&task.spec)?.outputs;
        let parent_data = task.data.clone();
        let thread_id = task.thread_id;

        let stale: Vec<Uuid> = task
            .children
            .iter()
            .copied()
            .filter(|c| {
                tree.get(*c)
                    .is_some_and(|c| c.state.is_predicted() && !outputs.contains(&c.spec))
            })
            .collect();
        let mut removed = Vec::new();
        for child in stale {
            removed.extend(tree.remove_subtree(child));
        }
        for gone in removed {
            self.drop_subprocess(gone);
        }

        let tree = self.tree_mut(key)?;
        let mut selected = Vec::new();
        for output in outputs {
            let existing = tree.task(id)?.children.iter().copied().find(|c| {
                tree.get(*c).is_some_and(|c| {
                    c.spec == *output && c.has_state(StateMask::PREDICTED | TaskState::Future)
                })
            });
            let child = match existing {
                Some(child) => {
                    let task = tree.task_mut(child)?;
                    task.data = parent_data.clone();
                    task.thread_id = thread_id;
                    task.set_state(TaskState::Future);
                    child
                }
                None => tree.insert_child(id, output, TaskState::Future, parent_data.clone(), thread_id),
            };
            if activate.contains(output) {
                selected.push(child);
            }
        }
        for child in selected {
            self.activate(key, child)?;
        }
        Ok(())
    }

    fn fork(&mut self, key: TreeKey, id: Uuid, spec: &TaskSpec, seeds: Vec<Map<String, Value>>) -> Result<()> {
        let SpecKind::ThreadSplit { thread_start, .. } = &spec.kind else {
            return Err(StructuralError::Invalid(format!("'{}' cannot spawn threads", spec.name)).into());
        };
        let tree = self.tree_mut(key)?;
        let (data, thread_id) = {
            let task = tree.task_mut(id)?;
            task.set_state(TaskState::Completed);
            task.internal_data
                .insert(thread::THREAD_COUNT_SLOT.to_string(), Value::from(seeds.len()));
            task.internal_data
                .insert(thread::THREADS_SLOT.to_string(), Value::Array(Vec::new()));
            (task.data.clone(), task.thread_id)
        };
        info!(task_id = %id, spec = %spec.name, threads = seeds.len(), "spawning threads");

        let mut starts = Vec::with_capacity(seeds.len());
        for seed in &seeds {
            let mut thread_data = data.clone();
            merge_maps(&mut thread_data, seed, MergeMode::Keep);
            starts.push(tree.insert_child(id, thread_start, TaskState::Future, thread_data, thread_id));
        }
        self.resolve_boundaries(key, id)?;
        for start in starts {
            self.activate(key, start)?;
        }
        Ok(())
    }

    fn new_thread(&mut self, key: TreeKey, id: Uuid, spec: &TaskSpec) -> Result<()> {
        let thread_id = self.next_thread_id;
        self.next_thread_id += 1;
        let tree = self.tree_mut(key)?;
        let parent = {
            let task = tree.task_mut(id)?;
            task.thread_id = thread_id;
            task.set_state(TaskState::Completed);
            task.parent
        };
        if let Some(parent) = parent {
            thread::record_thread(tree.task_mut(parent)?, thread_id);
        }
        debug!(task_id = %id, thread_id, "thread started");
        self.sync_children(key, id, &spec.outputs)
    }

    /// Joins fire once their policy is satisfied: the joining task becomes
    /// READY with the arrivals' data merged, other arrivals are cancelled.
    fn try_join(&mut self, key: TreeKey, id: Uuid, policy: &JoinPolicy) -> Result<bool> {
        let fired = match self.join_arrivals(key, id, policy) {
            Ok(fired) => fired,
            Err(WorkflowError::Structural(e)) => {
                self.tree_mut(key)?.task_mut(id)?.set_state(TaskState::Error);
                warn!(task_id = %id, error = %e, "join failed");
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };
        let Some((arrivals, thread_id)) = fired else { return Ok(false) };

        let tree = self.tree_mut(key)?;
        let mut data = Map::new();
        for arrival in &arrivals {
            merge_maps(&mut data, &tree.task(*arrival)?.data, MergeMode::Keep);
        }
        for arrival in &arrivals {
            if *arrival != id {
                tree.task_mut(*arrival)?.set_state(TaskState::Cancelled);
            }
        }
        let task = tree.task_mut(id)?;
        task.data = data;
        task.thread_id = thread_id;
        task.set_state(TaskState::Ready);
        info!(task_id = %id, spec = %task.spec, arrivals = arrivals.len(), "join fired");
        Ok(true)
    }

    /// The arrivals to merge, in merge order, and the thread the fired join
    /// continues in; `None` while the join must keep waiting.
    fn join_arrivals(&self, key: TreeKey, id: Uuid, policy: &JoinPolicy) -> Result<Option<(Vec<Uuid>, ThreadId)>> {
        let tree = self.tree(key)?;
        let task = tree.task(id)?;
        let spec = tree.blueprint.get(&task.spec)?;
        let is_arrival = |t: &Task| t.spec == spec.name && t.state == TaskState::Waiting;

        match policy {
            JoinPolicy::Plain => Ok(None),
            JoinPolicy::All | JoinPolicy::Reachable => {
                let mut arrivals: Vec<&Task> = tree
                    .walk()
                    .into_iter()
                    .filter_map(|a| tree.get(a))
                    .filter(|&t| is_arrival(t) && t.thread_id == task.thread_id)
                    .collect();
                let input_of = |t: &Task| {
                    let parent = t.parent.and_then(|p| tree.get(p)).map(|p| p.spec.as_str());
                    spec.inputs.iter().position(|i| Some(i.as_str()) == parent)
                };
                let satisfied = match policy {
                    JoinPolicy::All => {
                        let arrived: HashSet<usize> = arrivals.iter().filter_map(|&t| input_of(t)).collect();
                        (0..spec.inputs.len()).all(|i| arrived.contains(&i))
                    }
                    _ => !arrivals.is_empty() && !self.reachable_from_live(tree, &spec.name, task.thread_id),
                };
                if !satisfied {
                    return Ok(None);
                }
                arrivals.sort_by_key(|&t| input_of(t).unwrap_or(usize::MAX));
                Ok(Some((arrivals.iter().map(|t| t.id).collect(), task.thread_id)))
            }
            JoinPolicy::Threads { split } => {
                let split_id = tree
                    .ancestors(id)
                    .into_iter()
                    .find(|a| tree.get(*a).is_some_and(|t| t.spec == *split))
                    .ok_or_else(|| StructuralError::DanglingJoin {
                        merge: spec.name.clone(),
                        split: split.clone(),
                    })?;
                let split_task = tree.task(split_id)?;
                let spawned = thread::spawned_threads(split_task);
                let mut join = thread::ThreadJoin::new(&spec.name, spawned.iter().copied());

                let mut arrivals: Vec<&Task> = tree
                    .descendants(split_id)
                    .into_iter()
                    .filter_map(|a| tree.get(a))
                    .filter(|&t| is_arrival(t))
                    .collect();
                arrivals.sort_by_key(|t| t.thread_id);
                for arrival in &arrivals {
                    join.report(arrival.thread_id)?;
                }
                if !join.is_complete() || spawned.len() < thread::expected_thread_count(split_task) {
                    debug!(join = %spec.name, pending = join.pending().count(), "threads outstanding");
                    return Ok(None);
                }
                Ok(Some((arrivals.iter().map(|t| t.id).collect(), split_task.thread_id)))
            }
        }
    }

    /// Whether any live task of `thread` (other than arrivals at `join`) can
    /// still lead to `join`.
    fn reachable_from_live(&self, tree: &TaskTree, join: &str, thread: ThreadId) -> bool {
        tree.tasks().values().any(|t| {
            t.thread_id == thread
                && t.spec != join
                && is_live(tree, t)
                && tree.blueprint.can_reach(&t.spec, join)
        })
    }

    fn dispatch(&mut self, origin: TreeKey, event: &Event) -> Result<()> {
        match event.kind {
            EventKind::Terminate => {
                info!(tree = ?origin, "terminate event thrown");
                self.cancel_tree(origin)
            }
            _ => self.catch(event).map(|_| ()),
        }
    }

    /// Hands `event` to every waiting task whose descriptor accepts it.
    fn catch(&mut self, event: &Event) -> Result<usize> {
        let mut caught = 0;
        for (key, id) in self.walk_all() {
            let task = self.tree_mut(key)?.task_mut(id)?;
            if task.state != TaskState::Waiting {
                continue;
            }
            let descriptor = task
                .internal_data
                .get(DESCRIPTOR_SLOT)
                .and_then(|d| serde_json::from_value::<Event>(d.clone()).ok());
            let Some(descriptor) = descriptor else { continue };
            if descriptor.kind == EventKind::Timer || !descriptor.accepts(event) {
                continue;
            }
            record_catch(&mut task.internal_data, event);
            task.set_state(TaskState::Ready);
            info!(task_id = %id, spec = %task.spec, event = %event.name, kind = %event.kind, "event caught");
            caught += 1;
        }
        if caught == 0 {
            debug!(event = %event.name, kind = %event.kind, "event matched no waiting task");
        }
        Ok(caught)
    }

    fn cancel_subtree(&mut self, key: TreeKey, id: Uuid) -> Result<()> {
        let ids = self.tree(key)?.walk_from(id);
        for task_id in ids {
            let task = self.tree_mut(key)?.task_mut(task_id)?;
            if !task.state.is_finished() {
                task.set_state(TaskState::Cancelled);
            }
            if self.subprocesses.contains_key(&task_id) {
                self.cancel_tree(TreeKey::Sub(task_id))?;
            }
        }
        Ok(())
    }

    fn cancel_tree(&mut self, key: TreeKey) -> Result<()> {
        let root = self.tree(key)?.root;
        self.cancel_subtree(key, root)
    }

    fn drop_subprocess(&mut self, owner: Uuid) {
        if let Some(tree) = self.subprocesses.remove(&owner) {
            for id in tree.walk() {
                self.drop_subprocess(id);
            }
        }
    }

    /// Follow-up after every step: inclusive joins whose open branches died
    /// fire, finished sub-processes release their caller, and a top tree
    /// with nothing left to do is swept.
    fn settle(&mut self) -> Result<()> {
        loop {
            let mut changed = false;

            for (key, id) in self.walk_all() {
                let tree = self.tree(key)?;
                let Some(task) = tree.get(id) else { continue };
                if task.state != TaskState::Waiting {
                    continue;
                }
                if tree.blueprint.join_policy(&task.spec) == JoinPolicy::Reachable {
                    changed |= self.try_join(key, id, &JoinPolicy::Reachable)?;
                }
            }

            let owners: Vec<Uuid> = self.subprocesses.keys().copied().collect();
            for owner in owners {
                let Some(child) = self.subprocesses.get(&owner) else { continue };
                if child.tasks().values().any(|t| is_live(child, t)) {
                    continue;
                }
                let Some(key) = self.locate(owner) else { continue };
                if self.tree(key)?.get(owner).is_none_or(|t| t.state != TaskState::Waiting) {
                    continue;
                }
                self.cancel_tree(TreeKey::Sub(owner))?;
                self.tree_mut(key)?.task_mut(owner)?.set_state(TaskState::Ready);
                info!(task_id = %owner, "sub-process finished");
                changed = true;
            }

            if !changed {
                break;
            }
        }

        let idle = !self.top.tasks().values().any(|t| is_live(&self.top, t));
        let pending = self.top.tasks().values().any(|t| !t.state.is_finished());
        if idle && pending {
            self.cancel_tree(TreeKey::Top)?;
            info!(process = %self.top.blueprint.id, generation = self.generation, "workflow completed");
        }
        Ok(())
    }
}

/// READY, STARTED, or WAITING on something other than a join.
fn is_live(tree: &TaskTree, task: &Task) -> bool {
    match task.state {
        TaskState::Ready | TaskState::Started => true,
        TaskState::Waiting => tree.blueprint.join_policy(&task.spec) == JoinPolicy::Plain,
        _ => false,
    }
}

fn timer_deadline(task: &Task) -> Option<DateTime<Utc>> {
    let raw = task.internal_data.get(TIMER_SLOT)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
