//! Siphon ingestion engine
//!
//! A generic batch-ingestion engine for document stores. Given a source
//! collection, it runs a transform pipeline, streams candidate records,
//! applies a pluggable per-record processor, and durably records both
//! run-level bookkeeping (a batch run) and per-record failures, without
//! aborting the whole run on a single bad record unless configured to.
//!
//! # Architecture
//!
//! - **store**: document-store abstraction (`Collection` trait, cursors,
//!   in-memory and Postgres JSONB backends)
//! - **pipeline**: stage-list assembly from a filter, bounds, and a stage source
//! - **bookkeeping**: batch-run and failure persistence
//! - **processor**: per-record processing seam and failure isolation
//! - **metrics**: run counters and periodic diagnostic samples
//! - **options**: the per-invocation configuration surface
//! - **orchestrator**: the run lifecycle, start to finish
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use siphon_engine::{Ingester, IngestSpec, RunOptions, StageSource, SourceId};
//! use siphon_engine::store::memory::MemoryStore;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let spec = IngestSpec::builder("example", SourceId::fixed("demo"))
//!     .input("raw_things")
//!     .output("things")
//!     .stages(StageSource::Fixed(vec![]))
//!     .replace(true)
//!     .build();
//!
//! let ingester = Ingester::new(store);
//! let metrics = ingester.execute(&spec, RunOptions::default()).await?;
//! println!("inserted={}", metrics.inserted);
//! # Ok(())
//! # }
//! ```

pub mod bookkeeping;
pub mod metrics;
pub mod options;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod store;

pub use bookkeeping::{BatchFailure, BatchRun, BatchRunStore, FailureStore};
pub use metrics::{MetricsAggregator, PostIngestMetrics, RunMetrics};
pub use options::RunOptions;
pub use orchestrator::{IngestSpec, IngestSpecBuilder, Ingester, SourceId, SourceResolver};
pub use pipeline::{build_pipeline, PipelineArgs, StageSource};
pub use processor::{
    PostIngestHook, PostIngestOutcome, PreIngestHook, RecordContext, RecordOutcome,
    RecordProcessor,
};
pub use store::{
    AggregateOptions, Collection, DocumentStore, IndexSpec, RecordCursor, WriteOutcome,
};
