//! Deep-cleaning of JSON values
//!
//! Strips nulls and empty containers recursively. Used to drop unset
//! skip/limit stages from pipelines and to normalize record snapshots
//! before they are written to the failure store.

use serde_json::Value;

/// Recursively remove nulls and empty objects/arrays from a JSON value.
///
/// Returns `None` when the value cleans away entirely, so callers can use
/// the result directly with `Option` combinators.
pub fn deep_clean(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: serde_json::Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| deep_clean(v).map(|v| (k.clone(), v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        Value::Array(items) => {
            let cleaned: Vec<Value> = items.iter().filter_map(deep_clean).collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Array(cleaned))
            }
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_removes_nulls() {
        let value = json!({"a": 1, "b": null, "c": {"d": null}});
        assert_eq!(deep_clean(&value), Some(json!({"a": 1})));
    }

    #[test]
    fn test_clean_removes_empty_containers() {
        let value = json!({"a": {}, "b": [], "c": [null, null]});
        assert_eq!(deep_clean(&value), None);
    }

    #[test]
    fn test_clean_keeps_scalars() {
        let value = json!({"a": 0, "b": false, "c": ""});
        assert_eq!(deep_clean(&value), Some(json!({"a": 0, "b": false, "c": ""})));
    }

    #[test]
    fn test_clean_nested_arrays() {
        let value = json!([{"skip": null}, {"limit": 5}]);
        assert_eq!(deep_clean(&value), Some(json!([{"limit": 5}])));
    }
}
