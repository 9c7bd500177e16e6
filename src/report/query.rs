use crate::db::models::fields;
use crate::db::pipeline::{Average, Comparison, Condition, GroupSpec, Pipeline, Stage};
use crate::report::filter::TimeRange;

/// Output name of the mean `weight` per group.
pub const AVG_SOLD: &str = "avgSold";
/// Output name of the mean `totalWeight` per group.
pub const AVG_TOTAL: &str = "avgTotal";

/// Two stages: keep items with `after < timestamp < before`, then group by
/// `(sku, name)` averaging `weight` and `totalWeight`.
///
/// Grouping on the name as well as the sku keeps renamed items readable in the
/// report at the cost of splitting their statistics.
pub fn sold_item_pipeline(range: &TimeRange) -> Pipeline {
    Pipeline::new(vec![
        Stage::Match(vec![
            Condition {
                field: fields::TIMESTAMP,
                op: Comparison::Gt,
                value: range.after,
            },
            Condition {
                field: fields::TIMESTAMP,
                op: Comparison::Lt,
                value: range.before,
            },
        ]),
        Stage::Group(GroupSpec {
            key: vec![fields::SKU, fields::NAME],
            averages: vec![
                Average {
                    output: AVG_SOLD,
                    field: fields::WEIGHT,
                },
                Average {
                    output: AVG_TOTAL,
                    field: fields::TOTAL_WEIGHT,
                },
            ],
        }),
    ])
}
