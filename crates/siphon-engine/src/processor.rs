//! Per-record processing
//!
//! The caller-supplied `RecordProcessor` is invoked once per streamed
//! record: `Pending -> Processing -> {Succeeded, Failed}`, one transition
//! per record, no automatic retry. A failure is isolated into a
//! `BatchFailure` document and a `failed` count unless the run is
//! configured fail-on-error, in which case it aborts the whole run. This
//! isolation is the central failure-handling contract of the engine: a
//! malformed record must never stop the batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::bookkeeping::FailureStore;
use crate::store::{Collection, WriteOutcome};

/// Everything a processor sees for one record.
pub struct RecordContext<'a> {
    /// Handle to the output collection.
    pub output: &'a dyn Collection,
    /// The streamed record.
    pub record: &'a Value,
    /// The run's logical source identifier.
    pub source: &'a str,
    /// The run's reference date.
    pub date: DateTime<Utc>,
    /// True every *thresh*-th record; processors may emit extra diagnostics.
    pub is_sample: bool,
}

/// What one record's processing reported.
///
/// All-zero counters mean "scanned only": the record was processed but no
/// write was reported, counted as a single scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub upserted: u64,
    pub modified: u64,
    pub scanned: u64,
}

impl RecordOutcome {
    pub fn is_scan_only(&self) -> bool {
        self.upserted == 0 && self.modified == 0 && self.scanned == 0
    }

    /// Lift a collection write's reported counts into an outcome.
    pub fn from_write(outcome: &WriteOutcome) -> Self {
        Self {
            upserted: outcome.upserted_count(),
            modified: outcome.modified,
            scanned: 0,
        }
    }
}

impl From<WriteOutcome> for RecordOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        Self::from_write(&outcome)
    }
}

/// Caller-supplied per-record processing function.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, ctx: RecordContext<'_>) -> anyhow::Result<RecordOutcome>;
}

/// Runs once before the cursor is opened; failure is fatal.
#[async_trait]
pub trait PreIngestHook: Send + Sync {
    async fn run(&self, output: &dyn Collection, date: DateTime<Utc>) -> anyhow::Result<()>;
}

/// What the post-ingest hook reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostIngestOutcome {
    pub modified: u64,
}

/// Runs once after the last record; failure is fatal. A non-zero modified
/// count lands in the run's final metrics under `post_ingest.updated`.
#[async_trait]
pub trait PostIngestHook: Send + Sync {
    async fn run(
        &self,
        input: &dyn Collection,
        output: &dyn Collection,
        date: DateTime<Utc>,
    ) -> anyhow::Result<PostIngestOutcome>;
}

/// Terminal state of one record.
#[derive(Debug)]
pub(crate) enum Disposition {
    Succeeded(RecordOutcome),
    /// The failure was captured as data; the loop continues.
    Isolated,
}

/// Drive one record through the processor, isolating its failure unless the
/// run is fail-on-error. A bookkeeping failure while recording the
/// per-record failure is itself fatal.
pub(crate) async fn drive_record(
    processor: &dyn RecordProcessor,
    ctx: RecordContext<'_>,
    batch_id: &str,
    failures: &FailureStore,
    fail_on_error: bool,
) -> anyhow::Result<Disposition> {
    let record = ctx.record;
    match processor.process(ctx).await {
        Ok(outcome) => Ok(Disposition::Succeeded(outcome)),
        Err(err) if fail_on_error => Err(err),
        Err(err) => {
            debug!(error = %err, "caught record error, continuing");
            failures.create(batch_id, record, &err).await?;
            Ok(Disposition::Isolated)
        }
    }
}
