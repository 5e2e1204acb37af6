use crate::error::EvaluationError;
use crate::runtime::blueprint::TaskSpec;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::node::Step;
use crate::runtime::task::Task;

/// Completes and activates every output.
pub fn pass(spec: &TaskSpec) -> Step {
    Step::Jump(spec.outputs.clone())
}

pub fn run_script(
    spec: &TaskSpec,
    script: &str,
    task: &mut Task,
    evaluator: &dyn Evaluator,
) -> Result<Step, EvaluationError> {
    let mut data = task.data.clone();
    evaluator.execute(task, script, &mut data)?;
    task.data = data;
    Ok(pass(spec))
}
