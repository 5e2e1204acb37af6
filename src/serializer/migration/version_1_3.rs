//! 1.2 -> 1.3: event definition attributes are renamed, pending payloads are
//! keyed by event name, and the generation and thread counters are stored.

use serde_json::{json, Map, Value};

use super::{as_object, for_each_spec, for_each_task, malformed};
use crate::error::MigrationError;
use crate::events::CAUGHT_SLOT;
use crate::util::{merge_maps, MergeMode};

const VERSION: &str = "1.2";
// 1.2 payload slot: {"name": <event name>, "payload": <value>}
const LEGACY_EVENT_SLOT: &str = "event";

pub fn migrate(mut snapshot: Value) -> Result<Value, MigrationError> {
    for_each_spec(&mut snapshot, |spec| {
        if let Some(Value::Object(event)) = spec.get_mut("event") {
            rename_event_attributes(event)?;
        }
        Ok(())
    })?;

    let mut max_thread = 0;
    for_each_task(&mut snapshot, |task| {
        max_thread = max_thread.max(task.get("thread_id").and_then(Value::as_u64).unwrap_or(0));
        if let Some(Value::Object(internal)) = task.get_mut("internal_data") {
            rekey_pending_payload(internal)?;
        }
        Ok(())
    })?;

    let root = as_object(&mut snapshot, VERSION, "snapshot")?;
    root.entry("generation").or_insert(json!(0));
    root.entry("next_thread_id").or_insert(json!(max_thread + 1));
    Ok(snapshot)
}

fn rename_event_attributes(event: &mut Map<String, Value>) -> Result<(), MigrationError> {
    let mut renamed = event.clone();
    renamed.remove("external");
    if let Some(properties) = renamed.remove("correlation_properties") {
        let mut correlation = Map::new();
        for property in properties.as_array().into_iter().flatten() {
            let name = property.get("name").and_then(Value::as_str);
            let expression = property.get("expression").and_then(Value::as_str);
            let (Some(name), Some(expression)) = (name, expression) else {
                return Err(malformed(VERSION, "correlation property without name or expression"));
            };
            correlation.insert(name.to_string(), Value::String(expression.to_string()));
        }
        renamed.insert("correlation".to_string(), Value::Object(correlation));
    }
    if let Some(code) = renamed.remove("escalation_code") {
        renamed.insert("code".to_string(), code);
    }
    // Prune drops the old attribute names; everything else merges in place.
    merge_maps(event, &renamed, MergeMode::Prune);
    Ok(())
}

fn rekey_pending_payload(internal: &mut Map<String, Value>) -> Result<(), MigrationError> {
    let Some(pending) = internal.get(LEGACY_EVENT_SLOT) else { return Ok(()) };
    let name = pending
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MigrationError::Unsupported {
            version: VERSION.to_string(),
            construct: format!("pending event payload without an event name: {}", pending),
        })?;
    let payload = pending.get("payload").cloned().unwrap_or(Value::Null);
    internal.remove(LEGACY_EVENT_SLOT);
    internal.insert(name.clone(), payload);
    internal.insert(CAUGHT_SLOT.to_string(), Value::String(name));
    Ok(())
}
