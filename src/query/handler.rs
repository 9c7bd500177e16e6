use std::sync::Arc;

use serde_json::value::RawValue;
use tracing::{debug, error, info};

use crate::error::ReportError;
use crate::query::event::{QueryEvent, ResponseEvent};
use crate::report::{ReportGenerator, Stage};
use crate::types::SoldItemParams;

/// Turns one query event into exactly one response event.
pub struct QueryHandler {
    reports: Arc<ReportGenerator>,
}

impl QueryHandler {
    pub fn new(reports: Arc<ReportGenerator>) -> Self {
        Self { reports }
    }

    /// Never fails: every error is classified into a failure response that
    /// carries the request's correlation and aggregate ids.
    pub async fn handle(&self, event: &QueryEvent) -> ResponseEvent {
        debug!(correlation_id = %event.correlation_id, filter = %event.data.get(), "query received");

        match self.answer(event).await {
            Ok(result) => {
                info!(
                    correlation_id = %event.correlation_id,
                    filter = %event.data.get(),
                    "query answered"
                );
                ResponseEvent::success(event, result)
            }
            Err(err) => {
                error!(
                    stage = %err.stage(),
                    code = %err.code(),
                    correlation_id = %event.correlation_id,
                    filter = %event.data.get(),
                    "query failed: {err}"
                );
                ResponseEvent::failure(event, err.code(), err.to_string())
            }
        }
    }

    async fn answer(&self, event: &QueryEvent) -> Result<Box<RawValue>, ReportError> {
        let params: SoldItemParams = serde_json::from_str(event.data.get())
            .map_err(|e| ReportError::Validation(format!("unreadable filter payload: {e}")))?;

        let report = self.reports.generate(&params).await?;

        // Only the rows go back to the caller, not the stored report.
        let body = serde_json::to_string(&report.report_result).map_err(|e| ReportError::Construction {
            stage: Stage::Respond,
            reason: e.to_string(),
        })?;
        RawValue::from_string(body).map_err(|e| ReportError::Construction {
            stage: Stage::Respond,
            reason: e.to_string(),
        })
    }
}
