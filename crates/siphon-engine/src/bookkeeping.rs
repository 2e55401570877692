//! Batch-run and failure bookkeeping
//!
//! One `BatchRun` document per invocation, created before any record is
//! processed and finalized exactly once with end timestamp, elapsed time,
//! and final metrics. A run that aborts fatally stays open (no end
//! timestamp) as the durable signal of an unclean finish. Per-record
//! failures become `BatchFailure` documents referencing the owning run.
//!
//! Bookkeeping writes are load-bearing for observability: any store error
//! here is fatal to the whole run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use siphon_common::clean::deep_clean;
use siphon_common::{Result, SiphonError};

use crate::metrics::RunMetrics;
use crate::store::Collection;

/// Default collection for run records.
pub const BATCH_RUNS: &str = "batch_runs";

/// Default collection for per-record failure records.
pub const BATCH_FAILURES: &str = "batch_failures";

/// One end-to-end invocation of the engine, durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub initiator: String,
    pub source: String,
    pub input: String,
    pub output: String,
    pub begin_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    /// The resolved filter, serialized; absent when it cleaned away.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default)]
    pub is_replace: bool,
    /// Snapshot of the resolved run options.
    pub options: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RunMetrics>,
}

impl BatchRun {
    /// An open run has not been finalized; a fatal abort leaves it this way.
    pub fn is_open(&self) -> bool {
        self.end_date.is_none()
    }
}

/// A per-record failure isolated during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_id: String,
    /// Cleaned snapshot of the offending record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    pub error: String,
    /// The error and its source chain, outermost first.
    pub stack: Vec<String>,
}

/// Persists run records; the single source of truth for run observability.
#[derive(Clone)]
pub struct BatchRunStore {
    collection: Arc<dyn Collection>,
}

impl BatchRunStore {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self { collection }
    }

    /// Create the run record. Called exactly once, before processing begins.
    pub async fn create(&self, run: &BatchRun) -> Result<String> {
        let doc = serde_json::to_value(run)?;
        self.collection
            .insert_one(doc)
            .await
            .map_err(|e| SiphonError::Bookkeeping(format!("batch-run create: {e}")))
    }

    /// Finalize the run record. Called exactly once, at the end of a clean run.
    pub async fn finalize(
        &self,
        id: &str,
        end_date: DateTime<Utc>,
        elapsed_seconds: f64,
        metrics: &RunMetrics,
    ) -> Result<()> {
        let outcome = self
            .collection
            .update_one(
                &json!({ "_id": id }),
                &json!({ "$set": {
                    "end_date": end_date,
                    "elapsed_seconds": elapsed_seconds,
                    "metrics": metrics,
                }}),
                false,
            )
            .await
            .map_err(|e| SiphonError::Bookkeeping(format!("batch-run finalize: {e}")))?;

        if outcome.matched != 1 {
            return Err(SiphonError::Bookkeeping(format!(
                "batch-run finalize matched {} records for id={id}",
                outcome.matched
            )));
        }
        Ok(())
    }

    /// Fetch a run record by id.
    pub async fn find(&self, id: &str) -> Result<Option<BatchRun>> {
        let doc = self.collection.find_one(&json!({ "_id": id })).await?;
        doc.map(serde_json::from_value).transpose().map_err(Into::into)
    }
}

/// Persists one record per failed item, linked to the owning run.
#[derive(Clone)]
pub struct FailureStore {
    collection: Arc<dyn Collection>,
}

impl FailureStore {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self { collection }
    }

    /// Record an isolated per-record failure. The owning run id is routing
    /// context supplied by the engine, not by the processor.
    pub async fn create(
        &self,
        batch_id: &str,
        record: &Value,
        error: &anyhow::Error,
    ) -> Result<String> {
        let failure = BatchFailure {
            batch_id: batch_id.to_string(),
            record: deep_clean(record),
            error: error.to_string(),
            stack: error.chain().map(|cause| cause.to_string()).collect(),
        };
        let doc = serde_json::to_value(&failure)?;
        self.collection
            .insert_one(doc)
            .await
            .map_err(|e| SiphonError::Bookkeeping(format!("batch-failure create: {e}")))
    }

    /// Count failures recorded against a run.
    pub async fn count_for(&self, batch_id: &str) -> Result<u64> {
        self.collection.count(&json!({ "batch_id": batch_id })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::DocumentStore;

    fn sample_run() -> BatchRun {
        BatchRun {
            initiator: "test".to_string(),
            source: "unit".to_string(),
            input: "raw".to_string(),
            output: "cooked".to_string(),
            begin_date: Utc::now(),
            end_date: None,
            elapsed_seconds: None,
            query: None,
            skip: None,
            limit: None,
            is_replace: false,
            options: json!({}),
            metrics: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_finalize() {
        let store = MemoryStore::new();
        let runs = BatchRunStore::new(store.collection(BATCH_RUNS));

        let id = runs.create(&sample_run()).await.unwrap();
        let open = runs.find(&id).await.unwrap().unwrap();
        assert!(open.is_open());

        let metrics = RunMetrics {
            inserted: 2,
            ..Default::default()
        };
        runs.finalize(&id, Utc::now(), 0.25, &metrics).await.unwrap();

        let closed = runs.find(&id).await.unwrap().unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.elapsed_seconds, Some(0.25));
        assert_eq!(closed.metrics.unwrap().inserted, 2);
    }

    #[tokio::test]
    async fn test_finalize_unknown_run_is_bookkeeping_error() {
        let store = MemoryStore::new();
        let runs = BatchRunStore::new(store.collection(BATCH_RUNS));
        let err = runs
            .finalize("missing", Utc::now(), 0.0, &RunMetrics::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SiphonError::Bookkeeping(_)));
    }

    #[tokio::test]
    async fn test_failure_captures_chain_and_cleaned_record() {
        let store = MemoryStore::new();
        let failures = FailureStore::new(store.collection(BATCH_FAILURES));

        let root = anyhow::anyhow!("bad length");
        let err = root.context("record rejected");
        let record = json!({"a": 1, "junk": null});

        failures.create("run-1", &record, &err).await.unwrap();

        let doc = failures
            .collection
            .find_one(&json!({"batch_id": "run-1"}))
            .await
            .unwrap()
            .unwrap();
        let failure: BatchFailure = serde_json::from_value(doc).unwrap();
        assert_eq!(failure.error, "record rejected");
        assert_eq!(failure.stack, vec!["record rejected".to_string(), "bad length".to_string()]);
        assert_eq!(failure.record, Some(json!({"a": 1})));
        assert_eq!(failures.count_for("run-1").await.unwrap(), 1);
    }
}
