//! Typed aggregation pipeline handed to a [`DocumentStore`](super::DocumentStore).
//!
//! Field names are `&'static str` so a pipeline can only reference fields the
//! code knows about; request data only ever reaches a pipeline as typed values.

use std::fmt;

use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Lt,
}

impl Comparison {
    pub fn operator(&self) -> &'static str {
        match self {
            Comparison::Gt => "$gt",
            Comparison::Lt => "$lt",
        }
    }

    pub fn sql_operator(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Lt => "<",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: &'static str,
    pub op: Comparison,
    pub value: i64,
}

/// Arithmetic mean of `field`, emitted as `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Average {
    pub output: &'static str,
    pub field: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Fields forming the compound `_id` of each output row.
    pub key: Vec<&'static str>,
    pub averages: Vec<Average>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// All conditions must hold.
    Match(Vec<Condition>),
    Group(GroupSpec),
}

impl Stage {
    fn to_document(&self) -> Value {
        match self {
            Stage::Match(conditions) => {
                let mut fields = Map::new();
                for c in conditions {
                    let entry = fields
                        .entry(c.field)
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(ops) = entry {
                        ops.insert(c.op.operator().to_string(), json!(c.value));
                    }
                }
                json!({ "$match": fields })
            }
            Stage::Group(group) => {
                let mut id = Map::new();
                for k in &group.key {
                    id.insert(k.to_string(), json!(format!("${k}")));
                }
                let mut body = Map::new();
                body.insert("_id".to_string(), Value::Object(id));
                for avg in &group.averages {
                    body.insert(
                        avg.output.to_string(),
                        json!({ "$avg": format!("${}", avg.field) }),
                    );
                }
                json!({ "$group": body })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Mongo-style document form, e.g. `[{"$match":…},{"$group":…}]`.
    pub fn to_document(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_document).collect())
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}
