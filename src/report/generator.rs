use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::db::models::{decode_document, encode_document, fields, SoldReport};
use crate::db::DocumentStore;
use crate::error::{ReportError, Result};
use crate::report::ids::ReportIdSource;
use crate::report::{filter, query, reshape, Stage};
use crate::types::{ReportId, SoldItemParams};

/// Builds and persists sold-item reports. Holds no per-query state, so one
/// instance is shared by every query task.
pub struct ReportGenerator {
    store: Arc<dyn DocumentStore>,
    ids: Arc<dyn ReportIdSource>,
    sold_item_collection: String,
    report_collection: String,
}

impl ReportGenerator {
    pub fn new(store: Arc<dyn DocumentStore>, ids: Arc<dyn ReportIdSource>, cfg: &Config) -> Self {
        Self {
            store,
            ids,
            sold_item_collection: cfg.sold_item_collection.clone(),
            report_collection: cfg.report_collection.clone(),
        }
    }

    pub fn sold_item_collection(&self) -> &str {
        &self.sold_item_collection
    }

    pub fn report_collection(&self) -> &str {
        &self.report_collection
    }

    /// Validate, aggregate, reshape and persist. Exactly one insert happens on
    /// success and none on any failure. Nothing is retried.
    pub async fn generate(&self, params: &SoldItemParams) -> std::result::Result<SoldReport, ReportError> {
        let range = filter::validate(params)?;
        let pipeline = query::sold_item_pipeline(&range);
        debug!(stage = %Stage::Query, %pipeline, "aggregating sold items");

        let rows = self
            .store
            .aggregate(&self.sold_item_collection, &pipeline)
            .await
            .map_err(|source| ReportError::QueryExecution {
                collection: self.sold_item_collection.clone(),
                source,
            })?;
        if rows.is_empty() {
            return Err(ReportError::NoResults(self.sold_item_collection.clone()));
        }

        let results = reshape::reshape(rows)?;
        let report_id = self
            .ids
            .next_report_id()
            .map_err(ReportError::IdentifierGeneration)?;
        let search_query = SoldItemParams::between(range.after, range.before);
        let mut report = SoldReport::new(report_id, search_query, results);

        let doc = encode_document(&report).map_err(|e| ReportError::Construction {
            stage: Stage::Persist,
            reason: e.to_string(),
        })?;
        let id = self
            .store
            .insert_one(&self.report_collection, doc)
            .await
            .map_err(|source| ReportError::Persistence {
                collection: self.report_collection.clone(),
                source,
            })?;
        report.id = Some(id);

        info!(
            stage = %Stage::Persist,
            report_id = %report.report_id,
            document_id = %id,
            rows = report.report_result.len(),
            "report persisted"
        );
        Ok(report)
    }

    pub async fn find_report(&self, report_id: ReportId) -> Result<Option<SoldReport>> {
        let docs = self
            .store
            .find(&self.report_collection, fields::REPORT_ID, &report_id.encode())
            .await?;
        match docs.into_iter().next() {
            Some(doc) => Ok(Some(decode_document(doc)?)),
            None => Ok(None),
        }
    }
}
