use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Keys only present in the base survive the merge.
    #[default]
    Keep,
    /// Keys absent from the update are removed from the base.
    Prune,
}

/// Merges `update` into `base` in place and returns `base`.
///
/// Mappings are merged key by key. Sequences are merged by position: elements
/// that are mappings on both sides recurse, every other element is replaced,
/// and the result is truncated to the length of the update. Sequences are
/// never matched by content, so callers whose sequences can reorder must sort
/// them first.
pub fn merge<'a>(base: &'a mut Value, update: &Value, mode: MergeMode) -> &'a mut Value {
    merge_value(base, update, mode);
    base
}

/// Convenience for the common case of merging into a copy.
pub fn merged(base: &Value, update: &Value, mode: MergeMode) -> Value {
    let mut out = base.clone();
    merge_value(&mut out, update, mode);
    out
}

pub fn merge_maps(target: &mut Map<String, Value>, source: &Map<String, Value>, mode: MergeMode) {
    if mode == MergeMode::Prune {
        target.retain(|key, _| source.contains_key(key));
    }
    for (key, value) in source {
        match target.get_mut(key) {
            Some(existing) => merge_value(existing, value, mode),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_value(existing: &mut Value, value: &Value, mode: MergeMode) {
    if let (Value::Object(target), Value::Object(source)) = (&mut *existing, value) {
        merge_maps(target, source, mode);
        return;
    }
    if *existing == *value {
        return;
    }
    if let (Value::Array(target), Value::Array(source)) = (&mut *existing, value) {
        merge_sequence(target, source, mode);
        return;
    }
    *existing = value.clone();
}

fn merge_sequence(target: &mut Vec<Value>, source: &[Value], mode: MergeMode) {
    for (idx, value) in source.iter().enumerate() {
        match target.get_mut(idx) {
            Some(existing) if existing.is_object() && value.is_object() => {
                merge_value(existing, value, mode);
            }
            Some(existing) => *existing = value.clone(),
            None => target.push(value.clone()),
        }
    }
    // The update is authoritative for length; trailing base-only elements go.
    target.truncate(source.len());
}
