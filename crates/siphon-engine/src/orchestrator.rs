//! Run orchestration
//!
//! Sequences a whole batch run: resolve the logical source, prepare the
//! output, create the run record, stream and process records (or drain in
//! bulk), then finalize the run record. The store handle is released on
//! every exit path; a fatal error anywhere outside per-record processing
//! leaves the run record open and surfaces through the returned `Result`.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use siphon_common::clean::deep_clean;

use crate::bookkeeping::{BatchRun, BatchRunStore, FailureStore, BATCH_FAILURES, BATCH_RUNS};
use crate::metrics::{MetricsAggregator, PostIngestMetrics, RunMetrics};
use crate::options::RunOptions;
use crate::pipeline::{build_pipeline, PipelineArgs, StageSource};
use crate::processor::{
    drive_record, Disposition, PostIngestHook, PreIngestHook, RecordContext, RecordProcessor,
};
use crate::store::{ensure_indices, AggregateOptions, DocumentStore, IndexSpec};

/// The run's logical source identifier: a fixed name, or a resolver invoked
/// at the start of each run.
#[derive(Clone)]
pub enum SourceId {
    Fixed(String),
    Resolver(Arc<dyn SourceResolver>),
}

/// Resolves the logical source identifier at run start.
#[async_trait::async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

impl SourceId {
    pub fn fixed(source: impl Into<String>) -> Self {
        SourceId::Fixed(source.into())
    }

    async fn resolve(&self) -> Result<String> {
        match self {
            SourceId::Fixed(source) => Ok(source.clone()),
            SourceId::Resolver(resolver) => resolver.resolve().await,
        }
    }
}

/// Static description of an ingest: collections, pipeline, hooks, and the
/// optional per-record processor. Invocation-time knobs live in
/// [`RunOptions`].
pub struct IngestSpec {
    pub initiator: String,
    pub source: SourceId,
    pub input_name: String,
    pub output_name: String,
    pub output_indices: Vec<IndexSpec>,
    /// Static filter; the run's `query` option merges over it.
    pub filter: serde_json::Value,
    pub stages: StageSource,
    pub is_replace: bool,
    pub processor: Option<Arc<dyn RecordProcessor>>,
    pub pre_ingest: Option<Arc<dyn PreIngestHook>>,
    pub post_ingest: Option<Arc<dyn PostIngestHook>>,
}

impl IngestSpec {
    pub fn builder(initiator: impl Into<String>, source: SourceId) -> IngestSpecBuilder {
        IngestSpecBuilder {
            spec: IngestSpec {
                initiator: initiator.into(),
                source,
                input_name: String::new(),
                output_name: String::new(),
                output_indices: Vec::new(),
                filter: json!({}),
                stages: StageSource::Fixed(Vec::new()),
                is_replace: false,
                processor: None,
                pre_ingest: None,
                post_ingest: None,
            },
        }
    }
}

/// Builder for [`IngestSpec`].
pub struct IngestSpecBuilder {
    spec: IngestSpec,
}

impl IngestSpecBuilder {
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.spec.input_name = name.into();
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.spec.output_name = name.into();
        self
    }

    pub fn output_indices(mut self, indices: Vec<IndexSpec>) -> Self {
        self.spec.output_indices = indices;
        self
    }

    pub fn filter(mut self, filter: serde_json::Value) -> Self {
        self.spec.filter = filter;
        self
    }

    pub fn stages(mut self, stages: StageSource) -> Self {
        self.spec.stages = stages;
        self
    }

    pub fn replace(mut self, is_replace: bool) -> Self {
        self.spec.is_replace = is_replace;
        self
    }

    pub fn processor(mut self, processor: Arc<dyn RecordProcessor>) -> Self {
        self.spec.processor = Some(processor);
        self
    }

    pub fn pre_ingest(mut self, hook: Arc<dyn PreIngestHook>) -> Self {
        self.spec.pre_ingest = Some(hook);
        self
    }

    pub fn post_ingest(mut self, hook: Arc<dyn PostIngestHook>) -> Self {
        self.spec.post_ingest = Some(hook);
        self
    }

    pub fn build(self) -> IngestSpec {
        self.spec
    }
}

/// The ingestion orchestrator.
pub struct Ingester {
    store: Arc<dyn DocumentStore>,
}

impl Ingester {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Run an ingest end to end, releasing the store on every exit path.
    ///
    /// This is the top-level error boundary: any failure not isolated by
    /// the per-record path surfaces here.
    pub async fn execute(&self, spec: &IngestSpec, options: RunOptions) -> Result<RunMetrics> {
        let result = self.run(spec, &options).await;
        let closed = self.store.close().await;

        match (result, closed) {
            (Ok(metrics), Ok(())) => Ok(metrics),
            (Ok(_), Err(close_err)) => Err(close_err).context("releasing store"),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %close_err, "failed to release store");
                Err(err)
            }
        }
    }

    async fn run(&self, spec: &IngestSpec, options: &RunOptions) -> Result<RunMetrics> {
        let input_name = options
            .input_name
            .clone()
            .unwrap_or_else(|| spec.input_name.clone());
        let output_name = options
            .output_name
            .clone()
            .unwrap_or_else(|| spec.output_name.clone());
        if input_name.is_empty() || output_name.is_empty() {
            anyhow::bail!("ingest spec requires input and output collection names");
        }

        let source = spec.source.resolve().await.context("resolving source")?;
        let is_replace = options.is_replace.unwrap_or(spec.is_replace);
        let date = options.date;

        info!(
            initiator = %spec.initiator,
            %source,
            input = %input_name,
            output = %output_name,
            is_replace,
            "ingest begin"
        );

        let main_timer = Instant::now();

        let input = self.store.collection(&input_name);
        let output = self.store.collection(&output_name);
        let runs = BatchRunStore::new(self.store.collection(BATCH_RUNS));
        let failures = FailureStore::new(self.store.collection(BATCH_FAILURES));

        // Replace with a processor clears the output up front; without one,
        // the pipeline's own $out stage materializes the result set.
        if is_replace && spec.processor.is_some() {
            let cleared = output
                .delete_many(&json!({}))
                .await
                .context("clearing output collection")?;
            debug!(cleared, output = %output_name, "output cleared for replace run");
        }

        if let Some(hook) = &spec.pre_ingest {
            hook.run(&*output, date).await.context("pre-ingest hook")?;
        }

        ensure_indices(&*output, &spec.output_indices)
            .await
            .context("ensuring output indices")?;

        let count = input.count(&json!({})).await.context("counting source records")?;
        debug!(count, input = %input_name, "source record count");

        let filter = options.resolved_filter(&spec.filter);
        let pipeline = build_pipeline(&PipelineArgs {
            filter: &filter,
            skip: options.skip,
            limit: options.limit,
            stages: &spec.stages,
            date,
            materialize_into: (spec.processor.is_none() && is_replace)
                .then_some(output_name.as_str()),
        });
        debug!(pipeline = %serde_json::Value::Array(pipeline.clone()), "aggregate stages");

        let run = BatchRun {
            initiator: spec.initiator.clone(),
            source: source.clone(),
            input: input_name.clone(),
            output: output_name.clone(),
            begin_date: date,
            end_date: None,
            elapsed_seconds: None,
            // deep_clean gates presence only; the snapshot keeps the raw filter.
            query: deep_clean(&filter).map(|_| filter.to_string()),
            skip: options.skip,
            limit: options.limit,
            is_replace,
            options: serde_json::to_value(options)?,
            metrics: None,
        };
        let batch_id = runs.create(&run).await?;
        debug!(%batch_id, "batch run created");

        let cursor_options = AggregateOptions {
            batch_size: options.batch_size,
            max_time_ms: Some(options.cursor_timeout_ms),
            allow_disk_use: true,
        };
        let mut cursor = input
            .aggregate(&pipeline, cursor_options)
            .await
            .context("opening cursor")?;

        let mut aggregator = MetricsAggregator::new(options.thresh);

        if let Some(processor) = &spec.processor {
            while let Some(record) = cursor.try_next().await? {
                let is_sample = aggregator.begin_record();
                if is_sample {
                    debug!(record = %record, "sample record");
                }

                let ctx = RecordContext {
                    output: &*output,
                    record: &record,
                    source: &source,
                    date,
                    is_sample,
                };
                match drive_record(
                    processor.as_ref(),
                    ctx,
                    &batch_id,
                    &failures,
                    options.fail_on_error,
                )
                .await?
                {
                    Disposition::Succeeded(outcome) => aggregator.record_success(&outcome),
                    Disposition::Isolated => aggregator.record_failure(),
                }

                aggregator.end_record(is_sample);
            }
        } else {
            cursor.drain().await.context("draining cursor")?;
            aggregator.record_bulk_insert(count);
        }

        if let Some(hook) = &spec.post_ingest {
            let outcome = hook
                .run(&*input, &*output, date)
                .await
                .context("post-ingest hook")?;
            if outcome.modified > 0 {
                aggregator.set_post_ingest(PostIngestMetrics {
                    updated: outcome.modified,
                });
            }
        }

        let elapsed_seconds = main_timer.elapsed().as_secs_f64();
        let metrics = aggregator.into_metrics();
        runs.finalize(&batch_id, Utc::now(), elapsed_seconds, &metrics).await?;

        info!(
            %source,
            output = %output_name,
            source_records = count,
            inserted = metrics.inserted,
            updated = metrics.updated,
            scanned = metrics.scanned,
            failed = metrics.failed,
            elapsed_seconds,
            "ingest end"
        );

        Ok(metrics)
    }
}
