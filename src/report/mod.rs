//! Sold-item report pipeline: validate the filter, aggregate the sold-item
//! collection, reshape the rows and persist the report.

pub mod filter;
pub mod generator;
pub mod ids;
pub mod query;
pub mod reshape;

use std::fmt;

pub use generator::ReportGenerator;

/// Steps a query passes through. Any step may short-circuit to a failure
/// response; the stage is logged alongside the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Query,
    Reshape,
    Persist,
    Respond,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validate => "validate",
            Stage::Query => "query",
            Stage::Reshape => "reshape",
            Stage::Persist => "persist",
            Stage::Respond => "respond",
        };
        write!(f, "{s}")
    }
}
