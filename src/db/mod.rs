pub mod models;
pub mod pipeline;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::types::DocumentId;
use pipeline::Pipeline;

pub use sqlite::SqliteDocumentStore;

/// Document store the report pipeline runs against. Implementations must be
/// safe to share across concurrently running query tasks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run `pipeline` over `collection` and return its output rows, loosely typed.
    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>, StoreError>;

    /// Insert one document and return the surrogate key assigned to it.
    async fn insert_one(&self, collection: &str, document: Value) -> Result<DocumentId, StoreError>;

    /// Documents whose top-level `field` equals `value`, with `_id` filled in.
    async fn find(&self, collection: &str, field: &str, value: &str) -> Result<Vec<Value>, StoreError>;

    async fn count(&self, collection: &str) -> Result<u64, StoreError>;
}
