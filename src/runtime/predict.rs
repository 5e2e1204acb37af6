use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::runtime::blueprint::{Blueprint, GatewayKind, SpecKind};
use crate::runtime::engine::Workflow;
use crate::runtime::task::{StateMask, TaskState};

/// A task that would exist if the run continued from `anchor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    /// The live task this branch hangs off.
    pub anchor: Uuid,
    pub spec: String,
    /// LIKELY or MAYBE.
    pub state: TaskState,
    /// Steps below the anchor, starting at 1.
    pub depth: usize,
}

impl Workflow {
    /// Look-ahead from every live task. Nothing in the workflow is touched,
    /// so calling it twice yields the same result.
    ///
    /// Each spec is reported once per anchor, with the strongest state any
    /// path gives it.
    pub fn predict(&self) -> Vec<Prediction> {
        let mut out = Vec::new();
        for (key, id) in self.walk_all() {
            let Ok(tree) = self.tree(key) else { continue };
            let Some(task) = tree.get(id) else { continue };
            if !task.has_state(StateMask::LIVE) {
                continue;
            }
            out.extend(expand(&tree.blueprint, id, &task.spec));
        }
        out
    }
}

fn expand(blueprint: &Blueprint, anchor: Uuid, from: &str) -> Vec<Prediction> {
    let mut found: Vec<Prediction> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut queue = VecDeque::from([(from, TaskState::Likely, 1)]);

    while let Some((name, state, depth)) = queue.pop_front() {
        let Some(spec) = blueprint.spec(name) else { continue };
        let default = match &spec.kind {
            SpecKind::Gateway { gateway: GatewayKind::Exclusive | GatewayKind::Inclusive, conditions }
                if !conditions.is_empty() =>
            {
                Some(conditions.iter().find(|b| b.condition.is_none()).map(|b| b.target.as_str()))
            }
            _ => None,
        };

        for target in blueprint.successors(name) {
            if target == from {
                continue;
            }
            let branch_state = match default {
                Some(Some(default)) if default == target => state,
                Some(_) => TaskState::Maybe,
                None => state,
            };
            match index.get(target) {
                Some(&at) if !stronger(branch_state, found[at].state) => continue,
                Some(&at) => {
                    found[at].state = branch_state;
                    found[at].depth = depth;
                }
                None => {
                    index.insert(target, found.len());
                    found.push(Prediction {
                        anchor,
                        spec: target.to_string(),
                        state: branch_state,
                        depth,
                    });
                }
            }
            queue.push_back((target, branch_state, depth + 1));
        }
    }
    found
}

fn stronger(candidate: TaskState, current: TaskState) -> bool {
    candidate == TaskState::Likely && current == TaskState::Maybe
}
