//! Patch application.

use crate::error::{Result, SyncError};
use crate::types::Patch;
use serde_json::{Map, Value};

/// Apply a patch to a namespace value, producing the next value.
///
/// `null` behaves as the empty container for structured patches.
pub fn apply_patch(namespace: &str, state: &Value, patch: &Patch) -> Result<Value> {
    match patch {
        Patch::Replace(value) => Ok(value.clone()),

        Patch::Merge(fields) => {
            let mut obj = as_object(namespace, state)?;
            for (key, value) in fields {
                obj.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(obj))
        }

        Patch::Field { name, patch } => {
            let mut obj = as_object(namespace, state)?;
            let current = obj.get(name).cloned().unwrap_or(Value::Null);
            let next = apply_patch(namespace, &current, patch)?;
            obj.insert(name.clone(), next);
            Ok(Value::Object(obj))
        }

        Patch::Append(item) => {
            let mut arr = as_array(namespace, state)?;
            arr.push(item.clone());
            Ok(Value::Array(arr))
        }

        Patch::Edit { index, value } => {
            let mut arr = as_array(namespace, state)?;
            if *index >= arr.len() {
                return Err(SyncError::malformed(
                    namespace,
                    format!("edit index {} out of bounds (len {})", index, arr.len()),
                ));
            }
            arr[*index] = value.clone();
            Ok(Value::Array(arr))
        }

        Patch::Redact { start, end } => {
            let mut arr = as_array(namespace, state)?;

            // Clamp indices to valid range
            let start = (*start).min(arr.len());
            let end = (*end).min(arr.len());
            if start < end {
                arr.drain(start..end);
            }
            Ok(Value::Array(arr))
        }

        Patch::Remove(name) => {
            let mut obj = as_object(namespace, state)?;
            obj.remove(name);
            Ok(Value::Object(obj))
        }
    }
}

fn as_object(namespace: &str, state: &Value) -> Result<Map<String, Value>> {
    match state {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(SyncError::malformed(
            namespace,
            format!("expected object, found {}", kind_of(other)),
        )),
    }
}

fn as_array(namespace: &str, state: &Value) -> Result<Vec<Value>> {
    match state {
        Value::Null => Ok(Vec::new()),
        Value::Array(arr) => Ok(arr.clone()),
        other => Err(SyncError::malformed(
            namespace,
            format!("expected array, found {}", kind_of(other)),
        )),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replace() {
        let next = apply_patch("ns", &json!(1), &Patch::Replace(json!("hello"))).unwrap();
        assert_eq!(next, json!("hello"));
    }

    #[test]
    fn test_merge_into_null_and_object() {
        let next = apply_patch("ns", &Value::Null, &Patch::merge(json!({"a": 1}))).unwrap();
        assert_eq!(next, json!({"a": 1}));

        let next = apply_patch("ns", &next, &Patch::merge(json!({"b": 2, "a": 3}))).unwrap();
        assert_eq!(next, json!({"a": 3, "b": 2}));
    }

    #[test]
    fn test_merge_into_scalar_is_malformed() {
        let err = apply_patch("ns", &json!(5), &Patch::merge(json!({"a": 1}))).unwrap_err();
        assert!(matches!(err, SyncError::MalformedMutation { .. }));
    }

    #[test]
    fn test_append() {
        let state = apply_patch("ns", &Value::Null, &Patch::Append(json!(1))).unwrap();
        let state = apply_patch("ns", &state, &Patch::Append(json!(2))).unwrap();
        assert_eq!(state, json!([1, 2]));
    }

    #[test]
    fn test_redact() {
        let state = apply_patch("ns", &json!([1, 2, 3, 4, 5]), &Patch::Redact { start: 1, end: 3 })
            .unwrap();
        assert_eq!(state, json!([1, 4, 5]));

        // Out of range clamps to a no-op
        let state = apply_patch("ns", &state, &Patch::Redact { start: 10, end: 20 }).unwrap();
        assert_eq!(state, json!([1, 4, 5]));
    }

    #[test]
    fn test_edit() {
        let state = apply_patch(
            "ns",
            &json!(["a", "b", "c"]),
            &Patch::Edit { index: 1, value: json!("x") },
        )
        .unwrap();
        assert_eq!(state, json!(["a", "x", "c"]));

        let err = apply_patch("ns", &state, &Patch::Edit { index: 9, value: json!("y") });
        assert!(matches!(err, Err(SyncError::MalformedMutation { .. })));
    }

    #[test]
    fn test_nested_field_append() {
        let state = json!({"items": [1, 2], "meta": {}});
        let next = apply_patch("ns", &state, &Patch::field("items", Patch::Append(json!(3)))).unwrap();
        assert_eq!(next["items"], json!([1, 2, 3]));
        assert_eq!(next["meta"], json!({}));
    }

    #[test]
    fn test_remove_field() {
        let next = apply_patch("ns", &json!({"a": 1, "b": 2}), &Patch::Remove("a".into())).unwrap();
        assert_eq!(next, json!({"b": 2}));
    }
}
