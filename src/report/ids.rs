use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::types::ReportId;

/// Source of fresh report identifiers.
pub trait ReportIdSource: Send + Sync {
    fn next_report_id(&self) -> Result<ReportId, String>;
}

/// Random (v4) identifiers drawn from the operating system RNG. An RNG failure
/// is surfaced instead of falling back to a zero identifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsReportIds;

impl ReportIdSource for OsReportIds {
    fn next_report_id(&self) -> Result<ReportId, String> {
        let mut bytes = [0u8; 16];
        OsRng.try_fill_bytes(&mut bytes).map_err(|e| e.to_string())?;
        Ok(ReportId::from(uuid::Builder::from_random_bytes(bytes).into_uuid()))
    }
}
