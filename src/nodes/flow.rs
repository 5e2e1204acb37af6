use crate::error::EvaluationError;
use crate::runtime::blueprint::{Branch, GatewayKind, TaskSpec};
use crate::runtime::evaluator::Evaluator;
use crate::runtime::task::Task;

/// Picks the outputs a gateway activates.
///
/// Exclusive: the first branch whose condition holds, else the default.
/// Inclusive: every branch whose condition holds, else the default.
/// Parallel: every output.
pub fn select(
    spec: &TaskSpec,
    gateway: GatewayKind,
    conditions: &[Branch],
    task: &Task,
    evaluator: &dyn Evaluator,
) -> Result<Vec<String>, EvaluationError> {
    if gateway == GatewayKind::Parallel || conditions.is_empty() {
        return Ok(spec.outputs.clone());
    }

    let mut selected = Vec::new();
    let mut default = None;
    for branch in conditions {
        let Some(condition) = &branch.condition else {
            default.get_or_insert(&branch.target);
            continue;
        };
        if evaluator.condition(task, condition, &task.data)? {
            selected.push(branch.target.clone());
            if gateway == GatewayKind::Exclusive {
                break;
            }
        }
    }

    if selected.is_empty() {
        match default {
            Some(target) => selected.push(target.clone()),
            None => {
                return Err(EvaluationError::new(format!(
                    "no branch of gateway '{}' matched and it has no default",
                    spec.name
                )));
            }
        }
    }
    Ok(selected)
}
