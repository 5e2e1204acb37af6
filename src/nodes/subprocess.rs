use serde_json::{Map, Value};

use crate::runtime::node::Entry;
use crate::runtime::task::Task;
use crate::util::{merge_maps, MergeMode};

pub fn enter(process: &str) -> Entry {
    Entry::SubProcess(process.to_string())
}

/// Folds the finished child process's data back into the calling task.
pub fn absorb(task: &mut Task, result: &Map<String, Value>) {
    merge_maps(&mut task.data, result, MergeMode::Keep);
}
