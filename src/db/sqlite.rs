use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::db::pipeline::{Condition, GroupSpec, Pipeline, Stage};
use crate::db::DocumentStore;
use crate::error::StoreError;
use crate::types::DocumentId;

/// Document store on top of a single SQLite `documents` table, using the JSON1
/// functions for field access. Collection names, field paths and values are
/// always bind parameters.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    /// Upper bound on any single store operation.
    timeout: Duration,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map_err(StoreError::from)
    }
}

#[derive(Debug)]
enum Bind {
    Text(String),
    Int(i64),
}

/// A pipeline lowered to one `SELECT … GROUP BY` statement.
#[derive(Debug)]
struct CompiledAggregate {
    sql: String,
    binds: Vec<Bind>,
    key: Vec<&'static str>,
    outputs: Vec<&'static str>,
}

fn json_path(field: &str) -> String {
    format!("$.\"{field}\"")
}

fn compile_aggregate(collection: &str, pipeline: &Pipeline) -> Result<CompiledAggregate, StoreError> {
    let mut conditions: Vec<&Condition> = Vec::new();
    let mut group: Option<&GroupSpec> = None;
    for stage in &pipeline.stages {
        match stage {
            Stage::Match(c) if group.is_none() => conditions.extend(c.iter()),
            Stage::Group(g) if group.is_none() => group = Some(g),
            _ => {
                return Err(StoreError::UnsupportedPipeline(
                    "no stage may follow $group".to_string(),
                ))
            }
        }
    }
    let group = group.ok_or_else(|| StoreError::UnsupportedPipeline("missing $group stage".to_string()))?;
    if group.key.is_empty() {
        return Err(StoreError::UnsupportedPipeline("$group needs at least one key field".to_string()));
    }

    let mut binds = Vec::new();
    let mut columns = Vec::new();
    for k in &group.key {
        columns.push("json_quote(json_extract(body, ?))");
        binds.push(Bind::Text(json_path(k)));
    }
    for avg in &group.averages {
        columns.push("AVG(json_extract(body, ?))");
        binds.push(Bind::Text(json_path(avg.field)));
    }

    let mut sql = format!("SELECT {} FROM documents WHERE collection = ?", columns.join(", "));
    binds.push(Bind::Text(collection.to_string()));

    for c in conditions {
        sql.push_str(" AND json_extract(body, ?) ");
        sql.push_str(c.op.sql_operator());
        sql.push_str(" ?");
        binds.push(Bind::Text(json_path(c.field)));
        binds.push(Bind::Int(c.value));
    }

    sql.push_str(" GROUP BY ");
    sql.push_str(&vec!["json_extract(body, ?)"; group.key.len()].join(", "));
    for k in &group.key {
        binds.push(Bind::Text(json_path(k)));
    }
    // First-seen order; callers must not rely on it.
    sql.push_str(" ORDER BY MIN(id)");

    Ok(CompiledAggregate {
        sql,
        binds,
        key: group.key.clone(),
        outputs: group.averages.iter().map(|a| a.output).collect(),
    })
}

/// Rebuild the `{_id: {..key}, ..outputs}` row shape from positional columns.
/// Key columns come out of `json_quote`, so each must parse as JSON.
fn aggregate_row(row: &SqliteRow, compiled: &CompiledAggregate) -> Result<Value, StoreError> {
    let mut id = Map::new();
    for (i, k) in compiled.key.iter().enumerate() {
        let raw: String = row.try_get(i)?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|source| StoreError::InvalidGroupKey { field: *k, source })?;
        id.insert(k.to_string(), value);
    }

    let mut doc = Map::new();
    doc.insert("_id".to_string(), Value::Object(id));
    for (j, output) in compiled.outputs.iter().enumerate() {
        let avg: Option<f64> = row.try_get(compiled.key.len() + j)?;
        doc.insert(output.to_string(), avg.map(Value::from).unwrap_or(Value::Null));
    }
    Ok(Value::Object(doc))
}

fn stored_document(row: &SqliteRow) -> Result<Value, StoreError> {
    let id: i64 = row.try_get("id")?;
    let body: String = row.try_get("body")?;
    let mut doc: Value =
        serde_json::from_str(&body).map_err(|source| StoreError::CorruptDocument { id, source })?;
    if let Value::Object(map) = &mut doc {
        map.insert("_id".to_string(), Value::from(id));
    }
    Ok(doc)
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>, StoreError> {
        let compiled = compile_aggregate(collection, pipeline)?;
        debug!(collection, sql = %compiled.sql, "running aggregation");

        let mut query = sqlx::query(&compiled.sql);
        for bind in &compiled.binds {
            query = match bind {
                Bind::Text(s) => query.bind(s.as_str()),
                Bind::Int(v) => query.bind(*v),
            };
        }
        let rows = self.bounded(query.fetch_all(&self.pool)).await?;

        rows.iter().map(|row| aggregate_row(row, &compiled)).collect()
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<DocumentId, StoreError> {
        let Value::Object(mut map) = document else {
            return Err(StoreError::NotAnObject);
        };
        map.remove("_id");
        let body = Value::Object(map).to_string();

        let result = self
            .bounded(
                sqlx::query("INSERT INTO documents (collection, body, created_at) VALUES (?, ?, ?)")
                    .bind(collection)
                    .bind(body)
                    .bind(now_ms())
                    .execute(&self.pool),
            )
            .await?;

        Ok(DocumentId::new(result.last_insert_rowid()))
    }

    async fn find(&self, collection: &str, field: &str, value: &str) -> Result<Vec<Value>, StoreError> {
        let rows = self
            .bounded(
                sqlx::query(
                    "SELECT id, body FROM documents \
                     WHERE collection = ? AND json_extract(body, ?) = ? ORDER BY id",
                )
                .bind(collection)
                .bind(json_path(field))
                .bind(value)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.iter().map(stored_document).collect()
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let n: i64 = self
            .bounded(
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
                    .bind(collection)
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(n.max(0) as u64)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::models::tests::sold_item;
    use crate::db::models::encode_document;
    use crate::db::pipeline::{Average, Comparison};
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Single-connection in-memory store; the database lives as long as the pool.
    pub(crate) async fn memory_store() -> SqliteDocumentStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
        SqliteDocumentStore::new(pool, Duration::from_secs(5))
    }

    fn window_pipeline(gt: i64, lt: i64) -> Pipeline {
        Pipeline::new(vec![
            Stage::Match(vec![
                Condition { field: "timestamp", op: Comparison::Gt, value: gt },
                Condition { field: "timestamp", op: Comparison::Lt, value: lt },
            ]),
            Stage::Group(GroupSpec {
                key: vec!["sku", "name"],
                averages: vec![
                    Average { output: "avgSold", field: "weight" },
                    Average { output: "avgTotal", field: "totalWeight" },
                ],
            }),
        ])
    }

    async fn seed(store: &SqliteDocumentStore, items: &[(&str, &str, f64, f64, i64)]) {
        for &(sku, name, weight, total, ts) in items {
            let doc = encode_document(&sold_item(sku, name, weight, total, ts)).unwrap();
            store.insert_one("items", doc).await.unwrap();
        }
    }

    #[tokio::test]
    async fn groups_and_averages_inside_window() {
        let store = memory_store().await;
        seed(
            &store,
            &[
                ("A", "N", 100.0, 120.0, 10),
                ("A", "N", 110.0, 130.0, 12),
                ("B", "M", 105.0, 140.0, 20),
                ("B", "M", 999.0, 999.0, 30),
            ],
        )
        .await;

        let rows = store.aggregate("items", &window_pipeline(9, 21)).await.unwrap();
        assert_eq!(
            rows,
            vec![
                json!({ "_id": { "sku": "A", "name": "N" }, "avgSold": 105.0, "avgTotal": 125.0 }),
                json!({ "_id": { "sku": "B", "name": "M" }, "avgSold": 105.0, "avgTotal": 140.0 }),
            ]
        );
    }

    #[tokio::test]
    async fn bounds_are_exclusive() {
        let store = memory_store().await;
        seed(&store, &[("A", "N", 1.0, 1.0, 10), ("B", "M", 1.0, 1.0, 20)]).await;

        let rows = store.aggregate("items", &window_pipeline(10, 20)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn same_sku_with_different_names_are_separate_groups() {
        let store = memory_store().await;
        seed(&store, &[("A", "old", 1.0, 2.0, 10), ("A", "new", 3.0, 4.0, 11)]).await;

        let rows = store.aggregate("items", &window_pipeline(1, 100)).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn aggregation_is_scoped_to_collection() {
        let store = memory_store().await;
        seed(&store, &[("A", "N", 1.0, 1.0, 10)]).await;

        let rows = store.aggregate("other", &window_pipeline(1, 100)).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(store.count("items").await.unwrap(), 1);
        assert_eq!(store.count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_returns_document_with_surrogate_key() {
        let store = memory_store().await;
        let id = store
            .insert_one("reports", json!({ "_id": 99, "reportID": "r-1", "reportResult": [] }))
            .await
            .unwrap();

        let found = store.find("reports", "reportID", "r-1").await.unwrap();
        assert_eq!(found, vec![json!({ "_id": id, "reportID": "r-1", "reportResult": [] })]);
        assert!(store.find("reports", "reportID", "r-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_object_documents() {
        let store = memory_store().await;
        let err = store.insert_one("items", json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotAnObject));
    }

    #[test]
    fn pipeline_without_group_is_unsupported() {
        let pipeline = Pipeline::new(vec![Stage::Match(vec![])]);
        assert!(matches!(
            compile_aggregate("items", &pipeline),
            Err(StoreError::UnsupportedPipeline(_))
        ));
    }

    #[test]
    fn compiled_sql_carries_no_values() {
        let compiled = compile_aggregate("items; DROP TABLE documents", &window_pipeline(9, 21)).unwrap();
        assert!(!compiled.sql.contains("DROP"));
        assert!(!compiled.sql.contains("21"));
        assert_eq!(compiled.sql.matches('?').count(), compiled.binds.len());
    }

    #[tokio::test]
    async fn unquoted_group_key_is_a_store_error() {
        let store = memory_store().await;
        let compiled = CompiledAggregate {
            sql: String::new(),
            binds: vec![],
            key: vec!["sku"],
            outputs: vec!["avgSold"],
        };

        let row = sqlx::query("SELECT 'test-sku1', 1.0").fetch_one(&store.pool).await.unwrap();
        assert!(matches!(
            aggregate_row(&row, &compiled),
            Err(StoreError::InvalidGroupKey { field: "sku", .. })
        ));

        let row = sqlx::query("SELECT json_quote('test-sku1'), 1.0").fetch_one(&store.pool).await.unwrap();
        assert_eq!(
            aggregate_row(&row, &compiled).unwrap(),
            json!({ "_id": { "sku": "test-sku1" }, "avgSold": 1.0 })
        );
    }
}
