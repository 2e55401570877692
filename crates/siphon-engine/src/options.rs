//! Per-invocation run configuration
//!
//! An explicit options object rather than ambient argument state; every
//! field can be overridden at invocation time, and the resolved snapshot is
//! written into the batch-run record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Default transport batch-size hint for the cursor.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default diagnostic-sampling interval, in records.
pub const DEFAULT_THRESH: u64 = 100_000;

/// Default server-side execution time bound, in milliseconds.
pub const DEFAULT_CURSOR_TIMEOUT_MS: u64 = 300_000;

/// Env var overriding the default cursor timeout globally.
pub const CURSOR_TIMEOUT_ENV: &str = "SIPHON_CURSOR_TIMEOUT_MS";

/// The recognized run options.
#[derive(Debug, Clone, Serialize)]
pub struct RunOptions {
    /// Override the spec's input collection name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_name: Option<String>,

    /// Override the spec's output collection name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,

    /// Transport batch-size hint for the cursor.
    pub batch_size: usize,

    /// Diagnostic-sampling interval, in records.
    pub thresh: u64,

    /// Reference date passed to stage generators and hooks.
    pub date: DateTime<Utc>,

    /// Bound on the whole streaming/bulk operation.
    pub cursor_timeout_ms: u64,

    /// Per-record failures abort the run instead of being isolated.
    pub fail_on_error: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Filter merged over the spec's static filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,

    /// Override the spec's output-replacement semantics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_replace: Option<bool>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input_name: None,
            output_name: None,
            batch_size: DEFAULT_BATCH_SIZE,
            thresh: DEFAULT_THRESH,
            date: Utc::now(),
            cursor_timeout_ms: default_cursor_timeout_ms(),
            fail_on_error: false,
            skip: None,
            limit: None,
            query: None,
            is_replace: None,
        }
    }
}

impl RunOptions {
    /// The spec's static filter with the invocation's query merged over it.
    pub fn resolved_filter(&self, static_filter: &Value) -> Value {
        let Some(query) = &self.query else {
            return static_filter.clone();
        };
        let mut merged = static_filter
            .as_object()
            .cloned()
            .unwrap_or_default();
        if let Some(overrides) = query.as_object() {
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
        }
        Value::Object(merged)
    }
}

/// The global default cursor timeout: `SIPHON_CURSOR_TIMEOUT_MS` when set,
/// otherwise [`DEFAULT_CURSOR_TIMEOUT_MS`].
pub fn default_cursor_timeout_ms() -> u64 {
    std::env::var(CURSOR_TIMEOUT_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_CURSOR_TIMEOUT_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = RunOptions::default();
        assert_eq!(options.batch_size, 1000);
        assert_eq!(options.thresh, 100_000);
        assert!(!options.fail_on_error);
        assert!(options.skip.is_none());
    }

    #[test]
    fn test_resolved_filter_without_query() {
        let options = RunOptions::default();
        let filter = json!({"kind": "widget"});
        assert_eq!(options.resolved_filter(&filter), filter);
    }

    #[test]
    fn test_resolved_filter_merges_over_static() {
        let options = RunOptions {
            query: Some(json!({"kind": "gadget", "active": true})),
            ..Default::default()
        };
        let merged = options.resolved_filter(&json!({"kind": "widget", "tier": 2}));
        assert_eq!(merged, json!({"kind": "gadget", "tier": 2, "active": true}));
    }

    #[test]
    fn test_snapshot_omits_unset_fields() {
        let snapshot = serde_json::to_value(RunOptions::default()).unwrap();
        assert!(snapshot.get("skip").is_none());
        assert!(snapshot.get("query").is_none());
        assert_eq!(snapshot["batch_size"], json!(1000));
    }
}
