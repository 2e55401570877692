//! Document-store abstraction
//!
//! The engine consumes the database as an opaque handle with `count`,
//! `aggregate`, and `create_index` operations plus basic writes. Backends
//! implement the `Collection` trait; documents are `serde_json::Value`
//! objects with a string `_id`.
//!
//! Two backends ship with the engine:
//! - [`memory::MemoryStore`]: in-process, used by tests and embedders
//! - [`postgres::JsonbStore`]: a single JSONB-backed table via sqlx

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use siphon_common::Result;

pub mod cursor;
pub mod filter;
pub mod memory;
pub mod postgres;

pub use cursor::RecordCursor;

/// A connected document store: a namespace of collections plus a close
/// operation that must be called exactly once per run.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get a handle to a named collection (created lazily on first write).
    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    /// Release the underlying database resource.
    async fn close(&self) -> Result<()>;
}

/// A single collection of JSON documents.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Count documents matching the filter (empty filter counts all).
    async fn count(&self, filter: &Value) -> Result<u64>;

    /// Run a stage pipeline and return a streaming cursor over the results.
    ///
    /// A `$out` stage materializes the results into the named collection as
    /// a side effect; the cursor then yields nothing.
    async fn aggregate(&self, stages: &[Value], options: AggregateOptions)
        -> Result<RecordCursor>;

    /// Ensure an index exists for the given spec.
    async fn create_index(&self, index: &IndexSpec) -> Result<()>;

    /// Fetch the first document matching the filter.
    async fn find_one(&self, filter: &Value) -> Result<Option<Value>>;

    /// Insert a document, assigning a `_id` when absent. Returns the id.
    async fn insert_one(&self, doc: Value) -> Result<String>;

    /// Update the first document matching the filter.
    ///
    /// `update` is either a `{"$set": {...}}` document or a full
    /// replacement document. With `upsert`, a missing match inserts the
    /// filter merged with the update.
    async fn update_one(&self, filter: &Value, update: &Value, upsert: bool)
        -> Result<WriteOutcome>;

    /// Delete all documents matching the filter. Returns the deleted count.
    async fn delete_many(&self, filter: &Value) -> Result<u64>;
}

/// Options for an aggregate call.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Transport batch-size hint. A throughput tuning knob, not a semantic
    /// contract; backends may ignore it.
    pub batch_size: usize,

    /// Bound on the whole streaming/bulk operation, in milliseconds.
    /// Exceeding it fails the cursor.
    pub max_time_ms: Option<u64>,

    /// Allow the backend to spill to disk for large pipelines.
    pub allow_disk_use: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_time_ms: None,
            allow_disk_use: true,
        }
    }
}

/// An index specification for an output collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Document field paths making up the index key.
    pub keys: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Reported counts for a write operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub matched: u64,
    pub modified: u64,
    /// Id of the document inserted by an upsert, when one happened.
    pub upserted_id: Option<String>,
}

impl WriteOutcome {
    pub fn upserted_count(&self) -> u64 {
        u64::from(self.upserted_id.is_some())
    }
}

/// Ensure every index in the list exists on the collection.
pub async fn ensure_indices(collection: &dyn Collection, indices: &[IndexSpec]) -> Result<()> {
    for index in indices {
        collection.create_index(index).await?;
    }
    Ok(())
}

/// Assign a string `_id` when the document lacks one.
pub(crate) fn ensure_id(mut doc: Value) -> (Value, String) {
    if let Some(id) = doc.get("_id").and_then(Value::as_str) {
        let id = id.to_string();
        return (doc, id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(map) = doc.as_object_mut() {
        map.insert("_id".to_string(), Value::String(id.clone()));
    }
    (doc, id)
}

/// Apply a `$set` or full-replacement update to an existing document.
pub(crate) fn apply_update(existing: &Value, update: &Value) -> Result<Value> {
    use siphon_common::SiphonError;

    let update_map = update
        .as_object()
        .ok_or_else(|| SiphonError::InvalidDocument("update must be a document".to_string()))?;

    if let Some(set) = update_map.get("$set") {
        let set = set.as_object().ok_or_else(|| {
            SiphonError::InvalidDocument("$set requires a document".to_string())
        })?;
        let mut merged = existing.clone();
        if let Some(map) = merged.as_object_mut() {
            for (k, v) in set {
                map.insert(k.clone(), v.clone());
            }
        }
        return Ok(merged);
    }

    // Replacement document keeps the original id.
    let mut replacement = update.clone();
    if let (Some(map), Some(id)) = (replacement.as_object_mut(), existing.get("_id")) {
        map.insert("_id".to_string(), id.clone());
    }
    Ok(replacement)
}

/// Build the document inserted by an upsert: the filter's plain-equality
/// fields merged under the update.
pub(crate) fn upsert_document(filter: &Value, update: &Value) -> Result<Value> {
    use siphon_common::SiphonError;

    let mut base = serde_json::Map::new();

    if let Some(conditions) = filter.as_object() {
        for (path, condition) in conditions {
            let is_operator = condition
                .as_object()
                .is_some_and(|o| o.keys().any(|k| k.starts_with('$')));
            if !is_operator && !path.contains('.') && !condition.is_null() {
                base.insert(path.clone(), condition.clone());
            }
        }
    }

    let update_map = update
        .as_object()
        .ok_or_else(|| SiphonError::InvalidDocument("update must be a document".to_string()))?;

    if let Some(set) = update_map.get("$set").and_then(Value::as_object) {
        for (k, v) in set {
            base.insert(k.clone(), v.clone());
        }
    } else {
        for (k, v) in update_map {
            base.insert(k.clone(), v.clone());
        }
    }

    Ok(Value::Object(base))
}
