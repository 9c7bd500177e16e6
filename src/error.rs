use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::query::event::ErrorCode;
use crate::report::Stage;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Document store error: {0}")]
    Store(#[from] StoreError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Query event dropped: {0}")]
    Dropped(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Json(_)
            | AppError::Document(_)
            | AppError::Identifier(_)
            | AppError::Dropped(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ChannelSend(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(StoreError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Failures raised by a [`DocumentStore`](crate::db::DocumentStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("stored document {id} is not valid JSON: {source}")]
    CorruptDocument {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("aggregation key `{field}` is not valid JSON: {source}")]
    InvalidGroupKey {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("unsupported pipeline: {0}")]
    UnsupportedPipeline(String),
}

/// Failures while mapping between typed records and stored documents.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("invalid {kind} `{value}`: {source}")]
    Invalid {
        kind: &'static str,
        value: String,
        #[source]
        source: uuid::Error,
    },

    #[error("invalid document id `{0}`")]
    InvalidDocumentId(String),
}

/// An inbound event that cannot be trusted enough to answer. Dropped, never replied to.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("malformed event envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Everything that can go wrong between receiving a filter and persisting its report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid filter: {0}")]
    Validation(String),

    #[error("aggregation on `{collection}` failed: {source}")]
    QueryExecution {
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("no results found in `{0}` for the given filter")]
    NoResults(String),

    #[error("malformed aggregation row {index} ({row}): {reason}")]
    MalformedResult {
        index: usize,
        row: String,
        reason: String,
    },

    #[error("report id generation failed: {0}")]
    IdentifierGeneration(String),

    #[error("inserting report into `{collection}` failed: {source}")]
    Persistence {
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("internal error while building {stage} output: {reason}")]
    Construction { stage: Stage, reason: String },
}

impl ReportError {
    /// Classified code carried by the failure response.
    pub fn code(&self) -> ErrorCode {
        match self {
            ReportError::Validation(_) => ErrorCode::Validation,
            ReportError::NoResults(_) => ErrorCode::NoResults,
            ReportError::QueryExecution { .. } => ErrorCode::QueryExecution,
            ReportError::Persistence { .. } => ErrorCode::Persistence,
            ReportError::MalformedResult { .. }
            | ReportError::IdentifierGeneration(_)
            | ReportError::Construction { .. } => ErrorCode::Internal,
        }
    }

    /// Pipeline stage the failure happened in.
    pub fn stage(&self) -> Stage {
        match self {
            ReportError::Validation(_) => Stage::Validate,
            ReportError::QueryExecution { .. } | ReportError::NoResults(_) => Stage::Query,
            ReportError::MalformedResult { .. } => Stage::Reshape,
            ReportError::IdentifierGeneration(_) | ReportError::Persistence { .. } => Stage::Persist,
            ReportError::Construction { stage, .. } => *stage,
        }
    }
}
