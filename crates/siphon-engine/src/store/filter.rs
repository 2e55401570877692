//! Filter matching and pipeline-stage evaluation
//!
//! Backends share this evaluator: filters are plain JSON documents in the
//! usual document-query vocabulary (`{field: value}` equality, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`, dotted paths), and
//! pipelines are ordered lists of single-key stage documents (`$match`,
//! `$skip`, `$limit`, `$project`, `$out`). Unknown stages are rejected
//! rather than silently dropped.

use serde_json::{Map, Value};
use std::cmp::Ordering;

use siphon_common::{Result, SiphonError};

/// Resolve a dotted field path against a document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Does the document satisfy the filter? An empty filter matches everything.
pub fn matches_filter(filter: &Value, doc: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return filter.is_null();
    };

    conditions.iter().all(|(path, condition)| {
        let actual = get_path(doc, path);
        matches_condition(condition, actual)
    })
}

fn matches_condition(condition: &Value, actual: Option<&Value>) -> bool {
    if let Some(ops) = condition.as_object() {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, operand)| matches_operator(op, operand, actual));
        }
    }

    // Plain equality; a null operand also matches a missing field.
    match actual {
        Some(value) => value == condition,
        None => condition.is_null(),
    }
}

fn matches_operator(op: &str, operand: &Value, actual: Option<&Value>) -> bool {
    match op {
        "$eq" => matches_condition(operand, actual),
        "$ne" => !matches_condition(operand, actual),
        "$exists" => operand.as_bool().unwrap_or(false) == actual.is_some(),
        "$in" => operand
            .as_array()
            .is_some_and(|candidates| actual.is_some_and(|v| candidates.contains(v))),
        "$nin" => operand
            .as_array()
            .is_some_and(|candidates| !actual.is_some_and(|v| candidates.contains(v))),
        "$gt" => ordered(actual, operand).is_some_and(|o| o == Ordering::Greater),
        "$gte" => ordered(actual, operand).is_some_and(|o| o != Ordering::Less),
        "$lt" => ordered(actual, operand).is_some_and(|o| o == Ordering::Less),
        "$lte" => ordered(actual, operand).is_some_and(|o| o != Ordering::Greater),
        _ => false,
    }
}

fn ordered(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (actual?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// Result of evaluating a pipeline: the surviving documents, plus the
/// `$out` target when the pipeline materializes its own output.
#[derive(Debug)]
pub struct PipelineOutput {
    pub docs: Vec<Value>,
    pub out_target: Option<String>,
}

/// Evaluate a stage pipeline over an ordered document set.
pub fn run_pipeline(stages: &[Value], docs: Vec<Value>) -> Result<PipelineOutput> {
    let mut docs = docs;
    let mut out_target = None;

    for (position, stage) in stages.iter().enumerate() {
        let (name, spec) = single_key(stage)?;
        match name {
            "$match" => docs.retain(|doc| matches_filter(spec, doc)),
            "$skip" => {
                let n = stage_count(name, spec)? as usize;
                docs = docs.into_iter().skip(n).collect();
            }
            "$limit" => {
                let n = stage_count(name, spec)? as usize;
                docs.truncate(n);
            }
            "$project" => {
                docs = docs
                    .iter()
                    .map(|doc| project(spec, doc))
                    .collect::<Result<Vec<_>>>()?;
            }
            "$out" => {
                if position + 1 != stages.len() {
                    return Err(SiphonError::Store("$out must be the final stage".to_string()));
                }
                let target = spec.as_str().ok_or_else(|| {
                    SiphonError::Store("$out requires a collection name".to_string())
                })?;
                out_target = Some(target.to_string());
            }
            other => return Err(SiphonError::UnsupportedStage(other.to_string())),
        }
    }

    Ok(PipelineOutput { docs, out_target })
}

fn single_key(stage: &Value) -> Result<(&str, &Value)> {
    let obj = stage
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| SiphonError::Store(format!("malformed pipeline stage: {stage}")))?;
    let (name, spec) = obj.iter().next().ok_or_else(|| {
        SiphonError::Store("empty pipeline stage".to_string())
    })?;
    Ok((name.as_str(), spec))
}

fn stage_count(name: &str, spec: &Value) -> Result<u64> {
    spec.as_u64()
        .ok_or_else(|| SiphonError::Store(format!("{name} requires a non-negative integer")))
}

/// Apply a `$project` spec: `1`/`true` includes a field, a `"$path"` string
/// computes it from the source document, any other value is taken literally.
/// `_id` is carried over unless explicitly excluded with `0`.
fn project(spec: &Value, doc: &Value) -> Result<Value> {
    let fields = spec
        .as_object()
        .ok_or_else(|| SiphonError::Store("$project requires a document".to_string()))?;

    let mut result = Map::new();

    let id_excluded = matches!(fields.get("_id"), Some(v) if v == &Value::from(0) || v == &Value::Bool(false));
    if !id_excluded {
        if let Some(id) = doc.get("_id") {
            result.insert("_id".to_string(), id.clone());
        }
    }

    for (field, rule) in fields {
        if field == "_id" {
            continue;
        }
        match rule {
            Value::Number(n) if n.as_u64() == Some(1) => {
                if let Some(value) = get_path(doc, field) {
                    result.insert(field.clone(), value.clone());
                }
            }
            Value::Bool(true) => {
                if let Some(value) = get_path(doc, field) {
                    result.insert(field.clone(), value.clone());
                }
            }
            Value::String(path) if path.starts_with('$') => {
                if let Some(value) = get_path(doc, &path[1..]) {
                    result.insert(field.clone(), value.clone());
                }
            }
            literal => {
                result.insert(field.clone(), literal.clone());
            }
        }
    }

    Ok(Value::Object(result))
}
