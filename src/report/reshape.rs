use serde::Deserialize;
use serde_json::Value;

use crate::error::ReportError;
use crate::types::ReportResult;

#[derive(Debug, Deserialize)]
struct GroupKey {
    sku: String,
    name: String,
}

/// Shape of one aggregation output row. Never leaves this module.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateRow {
    #[serde(rename = "_id")]
    key: GroupKey,
    avg_sold: f64,
    avg_total: f64,
}

/// Convert aggregation rows into report rows, keeping input order.
/// The first row that does not match the expected shape fails the whole batch.
pub fn reshape(rows: Vec<Value>) -> Result<Vec<ReportResult>, ReportError> {
    rows.into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let row = AggregateRow::deserialize(&raw).map_err(|e| ReportError::MalformedResult {
                index,
                row: raw.to_string(),
                reason: e.to_string(),
            })?;
            Ok(ReportResult {
                sku: row.key.sku,
                name: row.key.name,
                sold_weight: row.avg_sold,
                total_weight: row.avg_total,
            })
        })
        .collect()
}
