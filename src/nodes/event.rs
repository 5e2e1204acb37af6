use chrono::Utc;
use serde_json::Value;

use crate::error::EvaluationError;
use crate::events::timer::{self, TIMER_SLOT};
use crate::events::{project_payload, EventDefinition, DESCRIPTOR_SLOT};
use crate::runtime::blueprint::TaskSpec;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::node::Step;
use crate::runtime::task::Task;

/// Prepares a catching task to wait: timers get a deadline, everything else
/// gets a resolved descriptor to correlate against.
pub fn wait_for(definition: &EventDefinition, task: &mut Task, evaluator: &dyn Evaluator) -> Result<(), EvaluationError> {
    if let EventDefinition::Timer { kind, expression } = definition {
        let value = evaluator.evaluate(task, expression, &task.data)?;
        let at = timer::deadline(*kind, &value, Utc::now())?;
        task.internal_data
            .insert(TIMER_SLOT.to_string(), Value::String(at.to_rfc3339()));
    }
    let descriptor = definition.resolve(task, evaluator)?;
    let descriptor = serde_json::to_value(descriptor)
        .map_err(|e| EvaluationError::new(format!("cannot store event descriptor: {}", e)))?;
    task.internal_data.insert(DESCRIPTOR_SLOT.to_string(), descriptor);
    Ok(())
}

/// A catcher runs once its event arrived: the payload moves into task data.
pub fn caught(spec: &TaskSpec, task: &mut Task) -> Step {
    project_payload(task);
    Step::Jump(spec.outputs.clone())
}

pub fn throw(
    spec: &TaskSpec,
    definition: &EventDefinition,
    task: &mut Task,
    evaluator: &dyn Evaluator,
) -> Result<Step, EvaluationError> {
    let event = definition.throw(task, evaluator)?;
    Ok(Step::Throw(event, spec.outputs.clone()))
}
