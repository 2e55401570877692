//! In-memory document store
//!
//! Backs tests and local embedding. Collections are ordered vectors of JSON
//! documents behind a shared lock; insertion order is delivery order, which
//! the engine's sequencing guarantees rely on.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use siphon_common::{Result, SiphonError};

use super::filter::{matches_filter, run_pipeline};
use super::{
    apply_update, ensure_id, upsert_document, AggregateOptions, Collection, DocumentStore,
    IndexSpec, RecordCursor, WriteOutcome,
};

type Collections = Arc<RwLock<HashMap<String, Vec<Value>>>>;

/// An in-process document store.
#[derive(Default)]
pub struct MemoryStore {
    collections: Collections,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(MemoryCollection {
            name: name.to_string(),
            collections: Arc::clone(&self.collections),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryCollection {
    name: String,
    collections: Collections,
}

impl MemoryCollection {
    fn lock_err() -> SiphonError {
        SiphonError::Store("collection lock poisoned".to_string())
    }

    fn snapshot(&self) -> Result<Vec<Value>> {
        let guard = self.collections.read().map_err(|_| Self::lock_err())?;
        Ok(guard.get(&self.name).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self, filter: &Value) -> Result<u64> {
        let docs = self.snapshot()?;
        Ok(docs.iter().filter(|doc| matches_filter(filter, doc)).count() as u64)
    }

    async fn aggregate(
        &self,
        stages: &[Value],
        options: AggregateOptions,
    ) -> Result<RecordCursor> {
        let docs = self.snapshot()?;
        let output = run_pipeline(stages, docs)?;

        if let Some(target) = output.out_target {
            let materialized: Vec<Value> =
                output.docs.into_iter().map(ensure_id).map(|(doc, _)| doc).collect();
            let mut guard = self.collections.write().map_err(|_| Self::lock_err())?;
            guard.insert(target, materialized);
            return Ok(RecordCursor::from_vec(Vec::new(), options.max_time_ms));
        }

        Ok(RecordCursor::from_vec(output.docs, options.max_time_ms))
    }

    async fn create_index(&self, _index: &IndexSpec) -> Result<()> {
        // No index structures to maintain in memory.
        Ok(())
    }

    async fn find_one(&self, filter: &Value) -> Result<Option<Value>> {
        let docs = self.snapshot()?;
        Ok(docs.into_iter().find(|doc| matches_filter(filter, doc)))
    }

    async fn insert_one(&self, doc: Value) -> Result<String> {
        let (doc, id) = ensure_id(doc);
        let mut guard = self.collections.write().map_err(|_| Self::lock_err())?;
        guard.entry(self.name.clone()).or_default().push(doc);
        Ok(id)
    }

    async fn update_one(
        &self,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> Result<WriteOutcome> {
        let mut guard = self.collections.write().map_err(|_| Self::lock_err())?;
        let docs = guard.entry(self.name.clone()).or_default();

        if let Some(doc) = docs.iter_mut().find(|doc| matches_filter(filter, doc)) {
            let updated = apply_update(doc, update)?;
            let modified = u64::from(updated != *doc);
            *doc = updated;
            return Ok(WriteOutcome {
                matched: 1,
                modified,
                upserted_id: None,
            });
        }

        if upsert {
            let (doc, id) = ensure_id(upsert_document(filter, update)?);
            docs.push(doc);
            return Ok(WriteOutcome {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            });
        }

        Ok(WriteOutcome::default())
    }

    async fn delete_many(&self, filter: &Value) -> Result<u64> {
        let mut guard = self.collections.write().map_err(|_| Self::lock_err())?;
        let docs = guard.entry(self.name.clone()).or_default();
        let before = docs.len();
        docs.retain(|doc| !matches_filter(filter, doc));
        Ok((before - docs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_id() {
        let store = MemoryStore::new();
        let coll = store.collection("things");
        let id = coll.insert_one(json!({"a": 1})).await.unwrap();
        let found = coll.find_one(&json!({"a": 1})).await.unwrap().unwrap();
        assert_eq!(found["_id"], json!(id));
    }

    #[tokio::test]
    async fn test_count_with_filter() {
        let store = MemoryStore::new();
        let coll = store.collection("things");
        for a in 1..=3 {
            coll.insert_one(json!({"a": a})).await.unwrap();
        }
        assert_eq!(coll.count(&json!({})).await.unwrap(), 3);
        assert_eq!(coll.count(&json!({"a": {"$gt": 1}})).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_one_set() {
        let store = MemoryStore::new();
        let coll = store.collection("things");
        coll.insert_one(json!({"a": 1, "b": "x"})).await.unwrap();

        let outcome = coll
            .update_one(&json!({"a": 1}), &json!({"$set": {"b": "y"}}), false)
            .await
            .unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.modified, 1);
        assert!(outcome.upserted_id.is_none());

        // No-op update reports matched without modified
        let outcome = coll
            .update_one(&json!({"a": 1}), &json!({"$set": {"b": "y"}}), false)
            .await
            .unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.modified, 0);
    }

    #[tokio::test]
    async fn test_update_one_upsert() {
        let store = MemoryStore::new();
        let coll = store.collection("things");

        let outcome = coll
            .update_one(&json!({"key": "k1"}), &json!({"$set": {"v": 1}}), true)
            .await
            .unwrap();
        assert_eq!(outcome.upserted_count(), 1);

        let found = coll.find_one(&json!({"key": "k1"})).await.unwrap().unwrap();
        assert_eq!(found["v"], json!(1));
    }

    #[tokio::test]
    async fn test_delete_many() {
        let store = MemoryStore::new();
        let coll = store.collection("things");
        for a in 1..=4 {
            coll.insert_one(json!({"a": a})).await.unwrap();
        }
        assert_eq!(coll.delete_many(&json!({"a": {"$lte": 2}})).await.unwrap(), 2);
        assert_eq!(coll.count(&json!({})).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_aggregate_out_materializes() {
        let store = MemoryStore::new();
        let input = store.collection("raw");
        for a in 1..=3 {
            input.insert_one(json!({"a": a})).await.unwrap();
        }

        let stages = vec![json!({"$match": {"a": {"$gte": 2}}}), json!({"$out": "cooked"})];
        let cursor = input
            .aggregate(&stages, AggregateOptions::default())
            .await
            .unwrap();
        assert_eq!(cursor.drain().await.unwrap(), 0);

        let cooked = store.collection("cooked");
        assert_eq!(cooked.count(&json!({})).await.unwrap(), 2);
    }
}
