use serde_json::{Map, Value};

use crate::error::EvaluationError;
use crate::events::Event;
use crate::nodes::{common, event, flow, subprocess, thread};
use crate::runtime::blueprint::{SpecKind, TaskSpec};
use crate::runtime::evaluator::Evaluator;
use crate::runtime::task::Task;

/// What a task asks of the engine once its run behavior has finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Complete and activate the named successors.
    Jump(Vec<String>),
    /// Complete and spawn one thread per seed; each seed is merged into the
    /// thread's data.
    Fork(Vec<Map<String, Value>>),
    /// Complete under a freshly allocated thread id, then activate every
    /// successor.
    NewThread,
    /// Park in STARTED until the driver submits the task.
    Suspend,
    /// Complete, activate the named successors, then throw the event.
    Throw(Event, Vec<String>),
}

/// How a task reacts to being activated by its predecessor.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Ready,
    /// Wait for an event or timer; the descriptor is already in internal data.
    Wait,
    /// Wait for a child process of the given id.
    SubProcess(String),
}

pub fn enter(spec: &TaskSpec, task: &mut Task, evaluator: &dyn Evaluator) -> Result<Entry, EvaluationError> {
    match &spec.kind {
        SpecKind::CatchEvent { event } | SpecKind::Boundary { event, .. } => {
            event::wait_for(event, task, evaluator)?;
            Ok(Entry::Wait)
        }
        SpecKind::SubProcess { process } => Ok(subprocess::enter(process)),
        SpecKind::Start
        | SpecKind::End { .. }
        | SpecKind::Task
        | SpecKind::Script { .. }
        | SpecKind::Manual
        | SpecKind::Gateway { .. }
        | SpecKind::ThrowEvent { .. }
        | SpecKind::BoundaryParent { .. }
        | SpecKind::ThreadSplit { .. }
        | SpecKind::ThreadStart
        | SpecKind::ThreadMerge { .. } => Ok(Entry::Ready),
    }
}

pub fn run(spec: &TaskSpec, task: &mut Task, evaluator: &dyn Evaluator) -> Result<Step, EvaluationError> {
    match &spec.kind {
        SpecKind::Start | SpecKind::Task | SpecKind::BoundaryParent { .. } | SpecKind::SubProcess { .. } => {
            Ok(common::pass(spec))
        }
        SpecKind::Script { script } => common::run_script(spec, script, task, evaluator),
        SpecKind::Manual => Ok(Step::Suspend),
        SpecKind::End { event: None } => Ok(common::pass(spec)),
        SpecKind::End { event: Some(event) } | SpecKind::ThrowEvent { event } => {
            event::throw(spec, event, task, evaluator)
        }
        SpecKind::CatchEvent { .. } | SpecKind::Boundary { .. } => Ok(event::caught(spec, task)),
        SpecKind::Gateway { gateway, conditions } => {
            flow::select(spec, *gateway, conditions, task, evaluator).map(Step::Jump)
        }
        SpecKind::ThreadSplit { times, collection, element_var, .. } => {
            thread::split(times.as_deref(), collection.as_deref(), element_var.as_deref(), task, evaluator)
        }
        SpecKind::ThreadStart => Ok(Step::NewThread),
        SpecKind::ThreadMerge { .. } => Ok(common::pass(spec)),
    }
}
