use crate::error::ReportError;
use crate::types::SoldItemParams;

/// A validated, two-sided timestamp window. Both bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub after: i64,
    pub before: i64,
}

/// Both bounds must be present and positive. A missing or zero bound is a
/// validation failure, never a match-all, so no unranged aggregation is issued.
pub fn validate(params: &SoldItemParams) -> Result<TimeRange, ReportError> {
    let comparator = params
        .timestamp
        .ok_or_else(|| ReportError::Validation("missing timestamp comparator".to_string()))?;

    let after = match comparator.gt {
        Some(v) if v > 0 => v,
        Some(v) => return Err(ReportError::Validation(format!("timestamp $gt must be positive, got {v}"))),
        None => return Err(ReportError::Validation("missing timestamp $gt".to_string())),
    };
    let before = match comparator.lt {
        Some(v) if v > 0 => v,
        Some(v) => return Err(ReportError::Validation(format!("timestamp $lt must be positive, got {v}"))),
        None => return Err(ReportError::Validation("missing timestamp $lt".to_string())),
    };

    Ok(TimeRange { after, before })
}
