//! Event definitions attached to throwing and catching task specs, and the
//! immutable [`Event`] values that travel between them.

pub mod timer;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EvaluationError;
use crate::runtime::evaluator::Evaluator;
use crate::runtime::task::Task;

pub use timer::TimerKind;

/// Internal-data slot holding the resolved descriptor of a waiting catcher.
pub const DESCRIPTOR_SLOT: &str = "event_definition";
/// Internal-data slot naming the slot a caught payload was stored under.
pub const CAUGHT_SLOT: &str = "caught";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    Signal,
    Timer,
    Cancel,
    Terminate,
    Escalation,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Message => "message",
            EventKind::Signal => "signal",
            EventKind::Timer => "timer",
            EventKind::Cancel => "cancel",
            EventKind::Terminate => "terminate",
            EventKind::Escalation => "escalation",
        };
        f.write_str(name)
    }
}

/// Spec-level description of an event. Expressions are evaluated against the
/// data of the task that throws or waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typename")]
pub enum EventDefinition {
    Message {
        name: String,
        /// Correlation key -> expression.
        #[serde(default)]
        correlation: BTreeMap<String, String>,
        #[serde(default)]
        payload: Option<String>,
        #[serde(default)]
        result_var: Option<String>,
    },
    Signal {
        name: String,
    },
    Timer {
        kind: TimerKind,
        expression: String,
    },
    Cancel,
    Terminate,
    Escalation {
        #[serde(default)]
        code: Option<String>,
    },
}

impl EventDefinition {
    pub fn message(name: &str) -> Self {
        EventDefinition::Message {
            name: name.to_string(),
            correlation: BTreeMap::new(),
            payload: None,
            result_var: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            EventDefinition::Message { .. } => EventKind::Message,
            EventDefinition::Signal { .. } => EventKind::Signal,
            EventDefinition::Timer { .. } => EventKind::Timer,
            EventDefinition::Cancel => EventKind::Cancel,
            EventDefinition::Terminate => EventKind::Terminate,
            EventDefinition::Escalation { .. } => EventKind::Escalation,
        }
    }

    /// Logical name; also the internal-data key a caught payload lands under.
    pub fn name(&self) -> &str {
        match self {
            EventDefinition::Message { name, .. } | EventDefinition::Signal { name } => name,
            EventDefinition::Escalation { code: Some(code) } => code,
            EventDefinition::Escalation { code: None } => "",
            EventDefinition::Timer { .. } => "timer",
            EventDefinition::Cancel => "cancel",
            EventDefinition::Terminate => "terminate",
        }
    }

    /// Builds a fresh event from the origin task's data. A definition thrown
    /// twice yields two independent values.
    pub fn throw(&self, origin: &Task, evaluator: &dyn Evaluator) -> Result<Event, EvaluationError> {
        let mut event = self.resolve(origin, evaluator)?;
        if let EventDefinition::Message { payload: Some(expr), .. } = self {
            event.payload = Some(evaluator.evaluate(origin, expr, &origin.data)?);
        }
        Ok(event)
    }

    /// The descriptor a catching task waits with: correlation values are
    /// evaluated, no payload is computed.
    pub fn resolve(&self, task: &Task, evaluator: &dyn Evaluator) -> Result<Event, EvaluationError> {
        let mut event = Event::new(self.kind(), self.name());
        if let EventDefinition::Message { correlation, result_var, .. } = self {
            for (key, expr) in correlation {
                let value = evaluator.evaluate(task, expr, &task.data)?;
                event.correlation.insert(key.clone(), value);
            }
            event.result_var = result_var.clone();
        }
        Ok(event)
    }
}

/// An immutable event value: thrown by one task, or describing what a waiting
/// task will accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub name: String,
    #[serde(default)]
    pub correlation: BTreeMap<String, Value>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub result_var: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            correlation: BTreeMap::new(),
            payload: None,
            result_var: None,
        }
    }

    pub fn message(name: &str) -> Self {
        Self::new(EventKind::Message, name)
    }

    pub fn signal(name: &str) -> Self {
        Self::new(EventKind::Signal, name)
    }

    pub fn escalation(code: &str) -> Self {
        Self::new(EventKind::Escalation, code)
    }

    pub fn cancel() -> Self {
        Self::new(EventKind::Cancel, "cancel")
    }

    pub fn terminate() -> Self {
        Self::new(EventKind::Terminate, "terminate")
    }

    pub fn with_correlation(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.correlation.insert(key.to_string(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Whether a catcher waiting with this descriptor accepts `incoming`.
    /// Every declared key must be present in the incoming event with an equal
    /// value; keys the descriptor does not declare are ignored.
    pub fn accepts(&self, incoming: &Event) -> bool {
        if self.kind != incoming.kind {
            return false;
        }
        let name_matches = match self.kind {
            EventKind::Escalation => self.name.is_empty() || self.name == incoming.name,
            EventKind::Cancel | EventKind::Terminate => true,
            _ => self.name == incoming.name,
        };
        name_matches
            && self
                .correlation
                .iter()
                .all(|(key, expected)| incoming.correlation.get(key) == Some(expected))
    }
}

/// Records a caught event in the catcher's internal data.
pub fn record_catch(internal: &mut Map<String, Value>, incoming: &Event) {
    internal.insert(incoming.name.clone(), incoming.payload.clone().unwrap_or(Value::Null));
    internal.insert(CAUGHT_SLOT.to_string(), Value::String(incoming.name.clone()));
}

/// Moves a caught payload into task data and clears the catch bookkeeping, so
/// a later pass through the same spec has to receive a fresh event.
pub fn project_payload(task: &mut Task) {
    let descriptor: Option<Event> = task
        .internal_data
        .remove(DESCRIPTOR_SLOT)
        .and_then(|v| serde_json::from_value(v).ok());
    let slot = match task.internal_data.remove(CAUGHT_SLOT) {
        Some(Value::String(slot)) => slot,
        _ => return,
    };
    let payload = task.internal_data.remove(&slot).unwrap_or(Value::Null);
    let Some(descriptor) = descriptor else { return };
    if descriptor.kind == EventKind::Message {
        let target = descriptor
            .result_var
            .unwrap_or_else(|| format!("{}_Response", task.spec));
        task.data.insert(target, payload);
    }
}
