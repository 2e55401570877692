//! Pipeline assembly
//!
//! Builds the ordered stage list for a run: the resolved filter first, then
//! cleaned skip/limit bounds, then the spec's transform stages. When no
//! per-record processor is supplied and the run replaces its output, a final
//! `$out` stage materializes the result set directly; with a processor, the
//! orchestrator clears the output collection instead. The two replace
//! strategies are mutually exclusive.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use siphon_common::clean::deep_clean;

/// Where a run's transform stages come from: a fixed list, or a generator
/// parameterized by the run's reference date.
#[derive(Clone)]
pub enum StageSource {
    Fixed(Vec<Value>),
    Generated(Arc<dyn Fn(DateTime<Utc>) -> Vec<Value> + Send + Sync>),
}

impl StageSource {
    pub fn generated<F>(f: F) -> Self
    where
        F: Fn(DateTime<Utc>) -> Vec<Value> + Send + Sync + 'static,
    {
        StageSource::Generated(Arc::new(f))
    }

    /// Resolve to a concrete stage list for the given reference date.
    pub fn resolve(&self, date: DateTime<Utc>) -> Vec<Value> {
        match self {
            StageSource::Fixed(stages) => stages.clone(),
            StageSource::Generated(generate) => generate(date),
        }
    }
}

impl fmt::Debug for StageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageSource::Fixed(stages) => f.debug_tuple("Fixed").field(stages).finish(),
            StageSource::Generated(_) => f.debug_tuple("Generated").field(&"<fn>").finish(),
        }
    }
}

/// Inputs to pipeline assembly.
#[derive(Debug)]
pub struct PipelineArgs<'a> {
    pub filter: &'a Value,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub stages: &'a StageSource,
    pub date: DateTime<Utc>,
    /// Replace-without-processor runs append `$out` to this collection.
    pub materialize_into: Option<&'a str>,
}

/// Assemble the full stage list for a run.
pub fn build_pipeline(args: &PipelineArgs<'_>) -> Vec<Value> {
    let mut pipeline = vec![json!({ "$match": args.filter })];

    let bounds = json!([
        { "$skip": args.skip },
        { "$limit": args.limit },
    ]);
    if let Some(Value::Array(bounds)) = deep_clean(&bounds) {
        pipeline.extend(bounds);
    }

    pipeline.extend(args.stages.resolve(args.date));

    if let Some(output) = args.materialize_into {
        pipeline.push(json!({ "$out": output }));
    }

    pipeline
}
