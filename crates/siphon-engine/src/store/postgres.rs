//! Postgres JSONB document store
//!
//! All collections share one `siphon_documents` table keyed by
//! (collection, id), with a sequence column preserving insertion order.
//! Filters and pipelines are evaluated by the shared evaluator over the
//! fetched bodies; `$out` materializes inside a transaction. Index specs
//! become expression indexes on JSONB paths, partial per collection.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use siphon_common::{Result, SiphonError};

use super::filter::{matches_filter, run_pipeline};
use super::{
    apply_update, ensure_id, upsert_document, AggregateOptions, Collection, DocumentStore,
    IndexSpec, RecordCursor, WriteOutcome,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS siphon_documents (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    seq        BIGSERIAL,
    body       JSONB NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS siphon_documents_order
    ON siphon_documents (collection, seq);
"#;

/// A Postgres-backed document store.
pub struct JsonbStore {
    pool: PgPool,
}

impl JsonbStore {
    /// Connect and ensure the backing schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(store_err)?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await.map_err(store_err)?;
        }

        Ok(Self { pool })
    }

    /// Wrap an existing pool (assumes the schema is already in place).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for JsonbStore {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(JsonbCollection {
            name: name.to_string(),
            pool: self.pool.clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

struct JsonbCollection {
    name: String,
    pool: PgPool,
}

impl JsonbCollection {
    /// All bodies in insertion order.
    async fn fetch_all(&self) -> Result<Vec<Value>> {
        let bodies: Vec<Value> = sqlx::query_scalar(
            "SELECT body FROM siphon_documents WHERE collection = $1 ORDER BY seq",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(bodies)
    }

    async fn insert_raw(&self, collection: &str, doc: &Value, id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO siphon_documents (collection, id, body) VALUES ($1, $2, $3)",
        )
        .bind(collection)
        .bind(id)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl Collection for JsonbCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self, filter: &Value) -> Result<u64> {
        if filter.as_object().is_some_and(|o| o.is_empty()) {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM siphon_documents WHERE collection = $1")
                    .bind(&self.name)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(store_err)?;
            return Ok(count as u64);
        }

        let docs = self.fetch_all().await?;
        Ok(docs.iter().filter(|doc| matches_filter(filter, doc)).count() as u64)
    }

    async fn aggregate(
        &self,
        stages: &[Value],
        options: AggregateOptions,
    ) -> Result<RecordCursor> {
        let docs = self.fetch_all().await?;
        let output = run_pipeline(stages, docs)?;

        if let Some(target) = output.out_target {
            let mut tx = self.pool.begin().await.map_err(store_err)?;
            sqlx::query("DELETE FROM siphon_documents WHERE collection = $1")
                .bind(&target)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            for doc in output.docs {
                let (doc, id) = ensure_id(doc);
                sqlx::query(
                    "INSERT INTO siphon_documents (collection, id, body) VALUES ($1, $2, $3)",
                )
                .bind(&target)
                .bind(&id)
                .bind(&doc)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            }
            tx.commit().await.map_err(store_err)?;
            return Ok(RecordCursor::from_vec(Vec::new(), options.max_time_ms));
        }

        Ok(RecordCursor::from_vec(output.docs, options.max_time_ms))
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<()> {
        // DDL cannot take bind parameters; identifiers are validated instead.
        validate_identifier(&self.name)?;
        for key in &index.keys {
            for segment in key.split('.') {
                validate_identifier(segment)?;
            }
        }

        let index_name = format!(
            "siphon_idx_{}_{}",
            self.name,
            index.keys.join("_").replace('.', "_")
        );
        let expressions: Vec<String> = index
            .keys
            .iter()
            .map(|key| format!("(body #>> '{{{}}}')", key.split('.').collect::<Vec<_>>().join(",")))
            .collect();
        let unique = if index.unique { "UNIQUE " } else { "" };
        let sql = format!(
            "CREATE {unique}INDEX IF NOT EXISTS {index_name} ON siphon_documents ({}) WHERE collection = '{}'",
            expressions.join(", "),
            self.name,
        );

        sqlx::query(&sql).execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    async fn find_one(&self, filter: &Value) -> Result<Option<Value>> {
        let docs = self.fetch_all().await?;
        Ok(docs.into_iter().find(|doc| matches_filter(filter, doc)))
    }

    async fn insert_one(&self, doc: Value) -> Result<String> {
        let (doc, id) = ensure_id(doc);
        self.insert_raw(&self.name, &doc, &id).await?;
        Ok(id)
    }

    async fn update_one(
        &self,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> Result<WriteOutcome> {
        let rows = sqlx::query(
            "SELECT id, body FROM siphon_documents WHERE collection = $1 ORDER BY seq",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        for row in rows {
            let id: String = row.get("id");
            let body: Value = row.get("body");
            if matches_filter(filter, &body) {
                let updated = apply_update(&body, update)?;
                let modified = u64::from(updated != body);
                if modified == 1 {
                    sqlx::query(
                        "UPDATE siphon_documents SET body = $3 WHERE collection = $1 AND id = $2",
                    )
                    .bind(&self.name)
                    .bind(&id)
                    .bind(&updated)
                    .execute(&self.pool)
                    .await
                    .map_err(store_err)?;
                }
                return Ok(WriteOutcome {
                    matched: 1,
                    modified,
                    upserted_id: None,
                });
            }
        }

        if upsert {
            let (doc, id) = ensure_id(upsert_document(filter, update)?);
            self.insert_raw(&self.name, &doc, &id).await?;
            return Ok(WriteOutcome {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            });
        }

        Ok(WriteOutcome::default())
    }

    async fn delete_many(&self, filter: &Value) -> Result<u64> {
        if filter.as_object().is_some_and(|o| o.is_empty()) {
            let result = sqlx::query("DELETE FROM siphon_documents WHERE collection = $1")
                .bind(&self.name)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
            return Ok(result.rows_affected());
        }

        let rows = sqlx::query(
            "SELECT id, body FROM siphon_documents WHERE collection = $1",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let ids: Vec<String> = rows
            .into_iter()
            .filter(|row| {
                let body: Value = row.get("body");
                matches_filter(filter, &body)
            })
            .map(|row| row.get("id"))
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "DELETE FROM siphon_documents WHERE collection = $1 AND id = ANY($2)",
        )
        .bind(&self.name)
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected())
    }
}

fn store_err(err: sqlx::Error) -> SiphonError {
    SiphonError::Store(err.to_string())
}

fn validate_identifier(s: &str) -> Result<()> {
    let ok = !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(SiphonError::Store(format!("invalid identifier for index DDL: {s:?}")))
    }
}
