//! Parallel threads of execution within one tree.
//!
//! A thread split spawns one internal thread-start task per thread. Each
//! thread start takes a fresh thread id that its descendants inherit, and a
//! thread merge waits until every spawned thread has reported.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::{EvaluationError, StructuralError};
use crate::runtime::evaluator::Evaluator;
use crate::runtime::node::Step;
use crate::runtime::task::{Task, ThreadId};

/// Split-task slot listing the thread ids its thread starts allocated.
pub const THREADS_SLOT: &str = "threads";
/// Split-task slot holding how many threads were spawned.
pub const THREAD_COUNT_SLOT: &str = "thread_count";

pub fn split(
    times: Option<&str>,
    collection: Option<&str>,
    element_var: Option<&str>,
    task: &Task,
    evaluator: &dyn Evaluator,
) -> Result<Step, EvaluationError> {
    let seeds: Vec<Map<String, Value>> = if let Some(expr) = collection {
        let Value::Array(items) = evaluator.evaluate(task, expr, &task.data)? else {
            return Err(EvaluationError::in_expression(expr, "collection is not an array"));
        };
        items
            .into_iter()
            .map(|item| {
                let mut seed = Map::new();
                if let Some(var) = element_var {
                    seed.insert(var.to_string(), item);
                }
                seed
            })
            .collect()
    } else if let Some(expr) = times {
        let count = evaluator
            .evaluate(task, expr, &task.data)?
            .as_u64()
            .ok_or_else(|| EvaluationError::in_expression(expr, "thread count is not a non-negative integer"))?;
        (0..count).map(|_| Map::new()).collect()
    } else {
        Vec::new()
    };

    if seeds.is_empty() {
        return Err(EvaluationError::new(format!("thread split '{}' spawned no threads", task.spec)));
    }
    Ok(Step::Fork(seeds))
}

/// Tracks which threads have reported to a merge.
#[derive(Debug, Clone)]
pub struct ThreadJoin {
    join: String,
    expected: BTreeSet<ThreadId>,
    received: BTreeSet<ThreadId>,
}

impl ThreadJoin {
    pub fn new(join: &str, expected: impl IntoIterator<Item = ThreadId>) -> Self {
        Self {
            join: join.to_string(),
            expected: expected.into_iter().collect(),
            received: BTreeSet::new(),
        }
    }

    /// Records a completion. Duplicates count once; a thread that was never
    /// spawned is a structural error. Returns whether every thread reported.
    pub fn report(&mut self, thread: ThreadId) -> Result<bool, StructuralError> {
        if !self.expected.contains(&thread) {
            return Err(StructuralError::UnknownThread {
                join: self.join.clone(),
                thread,
            });
        }
        self.received.insert(thread);
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    pub fn pending(&self) -> impl Iterator<Item = &ThreadId> {
        self.expected.difference(&self.received)
    }
}

/// Thread ids a split task has allocated so far.
pub fn spawned_threads(split: &Task) -> Vec<ThreadId> {
    split
        .internal_data
        .get(THREADS_SLOT)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

pub fn expected_thread_count(split: &Task) -> usize {
    split
        .internal_data
        .get(THREAD_COUNT_SLOT)
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

pub fn record_thread(split: &mut Task, thread: ThreadId) {
    let slot = split
        .internal_data
        .entry(THREADS_SLOT)
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(ids) = slot {
        ids.push(Value::from(thread));
    }
}
