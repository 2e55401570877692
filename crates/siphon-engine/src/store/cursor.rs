//! Streaming result cursor
//!
//! Wraps a server-side result stream with a whole-operation deadline.
//! Two modes of consumption: pull-next for per-record processing, and
//! drain-to-completion for bulk runs where the pipeline's own output stage
//! is the side effect.

use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::Value;
use std::time::{Duration, Instant};

use siphon_common::{Result, SiphonError};

/// A pull-based cursor over a streaming aggregation result.
pub struct RecordCursor {
    stream: BoxStream<'static, Result<Value>>,
    deadline: Option<Instant>,
    max_time_ms: u64,
    delivered: u64,
}

impl RecordCursor {
    /// Wrap a result stream, optionally bounded by a max execution time
    /// covering the whole streaming/bulk operation.
    pub fn new(stream: BoxStream<'static, Result<Value>>, max_time_ms: Option<u64>) -> Self {
        Self {
            stream,
            deadline: max_time_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
            max_time_ms: max_time_ms.unwrap_or(0),
            delivered: 0,
        }
    }

    /// Wrap an already-materialized result set.
    pub fn from_vec(docs: Vec<Value>, max_time_ms: Option<u64>) -> Self {
        Self::new(Box::pin(futures::stream::iter(docs.into_iter().map(Ok))), max_time_ms)
    }

    /// Pull the next record, or `None` at end of stream.
    pub async fn try_next(&mut self) -> Result<Option<Value>> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(SiphonError::CursorTimeout(self.max_time_ms));
            }
        }
        let next = self.stream.try_next().await?;
        if next.is_some() {
            self.delivered += 1;
        }
        Ok(next)
    }

    /// Consume the stream to completion, returning the number of records
    /// delivered. Used when the pipeline materializes its own output.
    pub async fn drain(mut self) -> Result<u64> {
        while self.try_next().await?.is_some() {}
        Ok(self.delivered)
    }

    /// Number of records delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pull_next_in_order() {
        let mut cursor = RecordCursor::from_vec(vec![json!({"a": 1}), json!({"a": 2})], None);
        assert_eq!(cursor.try_next().await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(cursor.try_next().await.unwrap(), Some(json!({"a": 2})));
        assert_eq!(cursor.try_next().await.unwrap(), None);
        assert_eq!(cursor.delivered(), 2);
    }

    #[tokio::test]
    async fn test_drain_counts_records() {
        let cursor = RecordCursor::from_vec(vec![json!({}), json!({}), json!({})], None);
        assert_eq!(cursor.drain().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_expired_deadline_fails() {
        let mut cursor = RecordCursor::from_vec(vec![json!({})], Some(0));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = cursor.try_next().await.unwrap_err();
        assert!(matches!(err, SiphonError::CursorTimeout(0)));
    }
}
