//! Stored document shapes. Identifiers travel as canonical strings, the
//! surrogate key as `_id`. Decoding is serde followed by `validate()`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DocumentError;
use crate::types::{DocumentId, FlashId, ItemId, ReportId, ReportResult, SaleId, SoldItemParams};

/// Field names of a stored [`SoldItem`], as referenced by aggregation pipelines.
pub mod fields {
    pub const SKU: &str = "sku";
    pub const NAME: &str = "name";
    pub const WEIGHT: &str = "weight";
    pub const TOTAL_WEIGHT: &str = "totalWeight";
    pub const TIMESTAMP: &str = "timestamp";
    pub const REPORT_ID: &str = "reportID";
}

const SURROGATE_KEY: &str = "_id";

pub trait Validate {
    fn validate(&self) -> Result<(), DocumentError>;
}

/// Decode a stored document and run its validation pass.
pub fn decode_document<T: DeserializeOwned + Validate>(doc: Value) -> Result<T, DocumentError> {
    let decoded: T = serde_json::from_value(doc)?;
    decoded.validate()?;
    Ok(decoded)
}

/// Encode a record for insertion. The surrogate key is always stripped; the store assigns it.
pub fn encode_document<T: Serialize>(record: &T) -> Result<Value, DocumentError> {
    let mut doc = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut doc {
        map.remove(SURROGATE_KEY);
    }
    Ok(doc)
}

// ---------------------------------------------------------------------------
// SoldItem
// ---------------------------------------------------------------------------

/// One unit sold during a flash sale. Written by upstream ingestion, read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoldItem {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DocumentId>,
    #[serde(rename = "flashID")]
    pub flash_id: FlashId,
    #[serde(rename = "itemID")]
    pub item_id: ItemId,
    #[serde(rename = "saleID")]
    pub sale_id: SaleId,
    pub sku: String,
    pub name: String,
    pub lot: String,
    pub weight: f64,
    #[serde(rename = "totalWeight")]
    pub total_weight: f64,
    pub timestamp: i64,
}

impl Validate for SoldItem {
    fn validate(&self) -> Result<(), DocumentError> {
        non_nil("flashID", self.flash_id.is_nil())?;
        non_nil("itemID", self.item_id.is_nil())?;
        non_nil("saleID", self.sale_id.is_nil())?;
        non_negative("weight", self.weight)?;
        non_negative("totalWeight", self.total_weight)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SoldReport
// ---------------------------------------------------------------------------

/// A persisted report. Created once per successful query, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoldReport {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DocumentId>,
    #[serde(rename = "reportID")]
    pub report_id: ReportId,
    #[serde(rename = "searchQuery")]
    pub search_query: SoldItemParams,
    #[serde(rename = "reportResult", default)]
    pub report_result: Vec<ReportResult>,
}

impl SoldReport {
    pub fn new(report_id: ReportId, search_query: SoldItemParams, report_result: Vec<ReportResult>) -> Self {
        Self {
            id: None,
            report_id,
            search_query,
            report_result,
        }
    }
}

impl Validate for SoldReport {
    fn validate(&self) -> Result<(), DocumentError> {
        non_nil("reportID", self.report_id.is_nil())?;
        for row in &self.report_result {
            non_negative("reportResult.soldWeight", row.sold_weight)?;
            non_negative("reportResult.totalWeight", row.total_weight)?;
        }
        Ok(())
    }
}

fn non_nil(field: &'static str, is_nil: bool) -> Result<(), DocumentError> {
    if is_nil {
        return Err(DocumentError::InvalidField {
            field,
            reason: "identifier must not be nil".to_string(),
        });
    }
    Ok(())
}

fn non_negative(field: &'static str, value: f64) -> Result<(), DocumentError> {
    if !value.is_finite() || value < 0.0 {
        return Err(DocumentError::InvalidField {
            field,
            reason: format!("expected a non-negative number, got {value}"),
        });
    }
    Ok(())
}
