use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::{LatencySnapshot, LatencyStats};
use crate::db::models::{decode_document, encode_document, SoldItem, SoldReport};
use crate::db::DocumentStore;
use crate::error::AppError;
use crate::query::{decode_delivery, Envelope, ResponseEvent};
use crate::report::ReportGenerator;
use crate::types::{DocumentId, ReportId};

#[derive(Clone)]
pub struct ApiState {
    pub service_name: String,
    pub store: Arc<dyn DocumentStore>,
    pub reports: Arc<ReportGenerator>,
    pub queries: mpsc::Sender<Envelope>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/query", post(post_query))
        .route("/reports/:report_id", get(get_report))
        .route("/sold-items", post(post_sold_items))
        .route("/health", get(get_health))
        .route("/stats/summary", get(get_stats_summary))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub inserted: usize,
    pub ids: Vec<DocumentId>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub service: String,
    pub sold_items: u64,
    pub reports: u64,
    pub queries: HealthSnapshot,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Hands one raw query event to the dispatcher and waits for its answer.
async fn post_query(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<ResponseEvent>, AppError> {
    let (envelope, reply) = Envelope::new(decode_delivery(&body));
    state
        .queries
        .send(envelope)
        .await
        .map_err(|e| AppError::ChannelSend(e.to_string()))?;

    // A dropped event never gets a reply: unreadable, or meant for another aggregate.
    let response = reply
        .await
        .map_err(|_| AppError::Dropped("event was not accepted by this service".to_string()))?;
    Ok(Json(response))
}

async fn get_report(
    State(state): State<ApiState>,
    Path(report_id): Path<String>,
) -> Result<Json<SoldReport>, AppError> {
    let report_id = ReportId::decode(&report_id)?;
    state
        .reports
        .find_report(report_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("report {report_id}")))
}

/// Bulk load of sold items. Every document is validated before the first insert.
async fn post_sold_items(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<IngestResponse>, AppError> {
    let docs: Vec<Value> = serde_json::from_slice(&body)?;
    let items = docs
        .into_iter()
        .map(decode_document::<SoldItem>)
        .collect::<Result<Vec<_>, _>>()?;

    let mut ids = Vec::with_capacity(items.len());
    for item in &items {
        let id = state
            .store
            .insert_one(state.reports.sold_item_collection(), encode_document(item)?)
            .await?;
        ids.push(id);
    }

    tracing::info!(inserted = ids.len(), collection = state.reports.sold_item_collection(), "sold items ingested");
    Ok(Json(IngestResponse { inserted: ids.len(), ids }))
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthSnapshot> {
    Json(state.health.snapshot())
}

async fn get_stats_summary(
    State(state): State<ApiState>,
) -> Result<Json<SummaryResponse>, AppError> {
    let sold_items = state.store.count(state.reports.sold_item_collection()).await?;
    let reports = state.store.count(state.reports.report_collection()).await?;

    Ok(Json(SummaryResponse {
        service: state.service_name.clone(),
        sold_items,
        reports,
        queries: state.health.snapshot(),
    }))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySnapshot> {
    Json(state.latency.snapshot())
}
