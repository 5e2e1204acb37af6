//! 1.1 -> 1.2
//!
//! * state codes: COMPLETED moves from 32 to 64 and CANCELLED from 64 to 256
//! * timer expressions written as `timedelta(...)` / `datetime(...)` become
//!   ISO-8601 string literals
//! * the implicit default branch of a conditional gateway (its first output
//!   without a condition) is listed explicitly
//! * `MultiInstance` specs become a thread split plus an internal thread start

use std::collections::HashSet;

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::{json, Map, Value};

use super::{for_each_spec, for_each_task, malformed};
use crate::error::MigrationError;
use crate::util::{merge, MergeMode};

const VERSION: &str = "1.1";
// 1.1 codes a fan-out may carry without having begun (MAYBE, LIKELY, FUTURE)
// or once it is over (COMPLETED, CANCELLED).
const NOT_STARTED: [u64; 3] = [1, 2, 4];
const FINISHED: [u64; 2] = [32, 64];

pub fn migrate(mut snapshot: Value) -> Result<Value, MigrationError> {
    let legacy = multi_instance_specs(&mut snapshot)?;
    if !legacy.is_empty() {
        for_each_task(&mut snapshot, |task| {
            let spec = task.get("task_spec").and_then(Value::as_str).unwrap_or_default();
            let state = task.get("state").and_then(Value::as_u64).unwrap_or(0);
            let in_flight = !NOT_STARTED.contains(&state) && !FINISHED.contains(&state);
            if legacy.contains(spec) && in_flight {
                return Err(MigrationError::Unsupported {
                    version: VERSION.to_string(),
                    construct: format!("multi-instance task '{}' is in flight", spec),
                });
            }
            Ok(())
        })?;
        rewrite_multi_instance(&mut snapshot, &legacy)?;
    }

    for_each_task(&mut snapshot, |task| {
        let new_code = match task.get("state").and_then(Value::as_u64) {
            Some(32) => 64,
            Some(64) => 256,
            _ => return Ok(()),
        };
        task.insert("state".to_string(), Value::from(new_code));
        Ok(())
    })?;

    for_each_spec(&mut snapshot, |spec| {
        if let Some(Value::Object(event)) = spec.get_mut("event") {
            rewrite_timer(event)?;
        }
        add_default_branch(spec);
        Ok(())
    })?;
    Ok(snapshot)
}

fn multi_instance_specs(snapshot: &mut Value) -> Result<HashSet<String>, MigrationError> {
    let mut names = HashSet::new();
    for_each_spec(snapshot, |spec| {
        if spec.get("typename").and_then(Value::as_str) == Some("MultiInstance") {
            let name = spec
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(VERSION, "multi-instance spec without a name"))?;
            names.insert(name.to_string());
        }
        Ok(())
    })?;
    Ok(names)
}

/// The instance body (the old outputs) moves behind a generated thread start.
fn rewrite_multi_instance(snapshot: &mut Value, legacy: &HashSet<String>) -> Result<(), MigrationError> {
    let mut visit = |blueprint: &mut Value| -> Result<(), MigrationError> {
        let Some(Value::Array(specs)) = blueprint.get_mut("task_specs") else { return Ok(()) };
        let mut added = Vec::new();
        for spec in specs.iter_mut() {
            let Some(name) = spec.get("name").and_then(Value::as_str).map(str::to_string) else { continue };
            if !legacy.contains(&name) {
                continue;
            }
            let thread_start = format!("{}_thread_start", name);
            let outputs = spec.get("outputs").cloned().unwrap_or_else(|| json!([]));
            added.push(json!({
                "name": thread_start,
                "internal": true,
                "typename": "ThreadStart",
                "inputs": [],
                "outputs": outputs,
            }));
            merge(
                spec,
                &json!({ "typename": "ThreadSplit", "thread_start": thread_start, "outputs": [] }),
                MergeMode::Keep,
            );
        }
        specs.extend(added);
        Ok(())
    };
    if let Some(spec) = snapshot.get_mut("spec") {
        visit(spec)?;
    }
    if let Some(Value::Object(subs)) = snapshot.get_mut("subprocess_specs") {
        for blueprint in subs.values_mut() {
            visit(blueprint)?;
        }
    }
    Ok(())
}

fn rewrite_timer(event: &mut Map<String, Value>) -> Result<(), MigrationError> {
    if event.get("typename").and_then(Value::as_str) != Some("Timer") {
        return Ok(());
    }
    let Some(expression) = event.get("expression").and_then(Value::as_str) else { return Ok(()) };
    let expression = expression.trim();
    let literal = if let Some(args) = call_args(expression, "timedelta") {
        iso_duration(args).ok_or_else(|| unsupported_expression(expression))?
    } else if let Some(args) = call_args(expression, "datetime") {
        iso_date(args).ok_or_else(|| unsupported_expression(expression))?
    } else if expression.contains("timedelta(") || expression.contains("datetime(") {
        return Err(unsupported_expression(expression));
    } else {
        return Ok(());
    };
    event.insert("expression".to_string(), Value::String(format!("\"{}\"", literal)));
    Ok(())
}

fn unsupported_expression(expression: &str) -> MigrationError {
    MigrationError::Unsupported {
        version: VERSION.to_string(),
        construct: format!("timer expression '{}'", expression),
    }
}

fn call_args<'a>(expression: &'a str, function: &str) -> Option<&'a str> {
    expression
        .strip_prefix(function)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

/// `weeks=1, hours=2.5` -> `P7DT2H30M`
fn iso_duration(args: &str) -> Option<String> {
    let mut seconds = 0.0;
    for arg in args.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        let (unit, amount) = arg.split_once('=')?;
        let amount: f64 = amount.trim().parse().ok()?;
        let scale = match unit.trim() {
            "weeks" => 604_800.0,
            "days" => 86_400.0,
            "hours" => 3_600.0,
            "minutes" => 60.0,
            "seconds" => 1.0,
            _ => return None,
        };
        seconds += amount * scale;
    }
    if seconds < 0.0 {
        return None;
    }

    let millis = (seconds * 1000.0).round() as u64;
    let days = millis / 86_400_000;
    let hours = millis / 3_600_000 % 24;
    let minutes = millis / 60_000 % 60;
    let rest = millis % 60_000;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    let mut time = String::new();
    if hours > 0 {
        time.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        time.push_str(&format!("{}M", minutes));
    }
    if rest > 0 {
        time.push_str(&format!("{}S", rest as f64 / 1000.0));
    }
    if !time.is_empty() {
        out.push('T');
        out.push_str(&time);
    }
    if out == "P" {
        out.push_str("T0S");
    }
    Some(out)
}

/// `2024, 5, 1, 12, 0` -> `2024-05-01T12:00:00+00:00`
fn iso_date(args: &str) -> Option<String> {
    let parts: Vec<u32> = args
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    if !(3..=6).contains(&parts.len()) {
        return None;
    }
    let at = |i: usize| parts.get(i).copied().unwrap_or(0);
    let naive = NaiveDate::from_ymd_opt(parts[0] as i32, parts[1], parts[2])?.and_hms_opt(at(3), at(4), at(5))?;
    Some(Utc.from_utc_datetime(&naive).to_rfc3339())
}

/// In 1.1 the default of a conditional gateway is implied: the first output
/// that has no condition of its own.
fn add_default_branch(spec: &mut Map<String, Value>) {
    if spec.get("typename").and_then(Value::as_str) != Some("Gateway") {
        return;
    }
    let Some(Value::Array(conditions)) = spec.get("conditions") else { return };
    if conditions.is_empty() || conditions.iter().any(|b| b.get("condition").is_none_or(Value::is_null)) {
        return;
    }
    let covered: HashSet<&str> = conditions
        .iter()
        .filter_map(|b| b.get("target").and_then(Value::as_str))
        .collect();
    let default = spec
        .get("outputs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|o| !covered.contains(o))
        .map(str::to_string);
    let Some(default) = default else { return };
    if let Some(Value::Array(conditions)) = spec.get_mut("conditions") {
        conditions.push(json!({ "condition": null, "target": default }));
    }
}
