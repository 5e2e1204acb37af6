use std::fmt::Debug;

use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::{Map, Value, json};

use crate::error::EvaluationError;
use crate::runtime::task::Task;

type EvalValue = evalexpr::Value<DefaultNumericTypes>;

/// Evaluates task expressions and scripts. The engine never interprets
/// expression text itself; hosts plug in their own sandbox.
pub trait Evaluator: Send + Sync + Debug {
    fn evaluate(&self, task: &Task, expression: &str, data: &Map<String, Value>) -> Result<Value, EvaluationError>;

    /// Runs a script that may assign into `data`.
    fn execute(&self, task: &Task, script: &str, data: &mut Map<String, Value>) -> Result<(), EvaluationError>;

    fn condition(&self, task: &Task, expression: &str, data: &Map<String, Value>) -> Result<bool, EvaluationError> {
        match self.evaluate(task, expression, data)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvaluationError::in_expression(
                expression,
                format!("expected a boolean, got {}", other),
            )),
        }
    }
}

/// Default evaluator backed by `evalexpr`.
///
/// A bare variable name (or dotted path) is looked up directly so that
/// objects and arrays survive, since evalexpr has no map type. Scripts are
/// `;`-separated `name = expression` statements.
#[derive(Debug, Default, Clone)]
pub struct EvalexprEvaluator;

impl EvalexprEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for EvalexprEvaluator {
    fn evaluate(&self, _task: &Task, expression: &str, data: &Map<String, Value>) -> Result<Value, EvaluationError> {
        let expr = expression.trim();
        if let Some(found) = lookup_path(data, expr) {
            return Ok(found.clone());
        }
        let ctx = build_context(data)?;
        let result = eval_with_context(expr, &ctx)
            .map_err(|e| EvaluationError::in_expression(expr, e.to_string()))?;
        Ok(to_json(result))
    }

    fn execute(&self, _task: &Task, script: &str, data: &mut Map<String, Value>) -> Result<(), EvaluationError> {
        let mut ctx = build_context(data)?;
        for statement in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((target, rhs)) = split_assignment(statement) else {
                // Bare expressions still have to evaluate cleanly.
                eval_with_context(statement, &ctx)
                    .map_err(|e| EvaluationError::in_expression(statement, e.to_string()))?;
                continue;
            };
            let value = match lookup_path(data, rhs) {
                Some(found) => found.clone(),
                None => eval_with_context(rhs, &ctx)
                    .map(to_json)
                    .map_err(|e| EvaluationError::in_expression(statement, e.to_string()))?,
            };
            data.insert(target.to_string(), value);
            // evalexpr variables keep their first type; an assignment may change it.
            ctx = build_context(data)?;
        }
        Ok(())
    }
}

fn lookup_path<'a>(data: &'a Map<String, Value>, expr: &str) -> Option<&'a Value> {
    let is_path = !expr.is_empty()
        && expr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !expr.starts_with(|c: char| c.is_ascii_digit());
    if !is_path {
        return None;
    }
    let mut parts = expr.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Splits `name = expr`, ignoring comparison operators.
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let bytes = statement.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'=' {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(i + 1).copied();
        if matches!(prev, Some(b'=' | b'!' | b'<' | b'>')) || next == Some(b'=') {
            continue;
        }
        let target = statement[..i].trim();
        let valid = !target.is_empty() && target.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        return valid.then(|| (target, statement[i + 1..].trim()));
    }
    None
}

fn build_context(data: &Map<String, Value>) -> Result<HashMapContext<DefaultNumericTypes>, EvaluationError> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in data {
        if let Some(ev) = to_eval(v) {
            ctx.set_value(k.clone(), ev)
                .map_err(|e| EvaluationError::new(format!("cannot bind '{}': {}", k, e)))?;
        }
    }
    Ok(ctx)
}

fn to_eval(value: &Value) -> Option<EvalValue> {
    match value {
        Value::String(s) => Some(EvalValue::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(EvalValue::Int(i))
            } else {
                n.as_f64().map(EvalValue::Float)
            }
        }
        Value::Bool(b) => Some(EvalValue::Boolean(*b)),
        Value::Array(items) => items
            .iter()
            .map(to_eval)
            .collect::<Option<Vec<_>>>()
            .map(EvalValue::Tuple),
        Value::Null => Some(EvalValue::Empty),
        Value::Object(_) => None,
    }
}

fn to_json(value: EvalValue) -> Value {
    match value {
        EvalValue::String(s) => Value::String(s),
        EvalValue::Int(i) => json!(i),
        EvalValue::Float(f) => json!(f),
        EvalValue::Boolean(b) => Value::Bool(b),
        EvalValue::Tuple(items) => Value::Array(items.into_iter().map(to_json).collect()),
        EvalValue::Empty => Value::Null,
    }
}
