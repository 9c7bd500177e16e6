use std::fmt;
use std::str::FromStr;

use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::IdentifierError;

// ---------------------------------------------------------------------------
// Domain identifiers, stored as their canonical string form
// ---------------------------------------------------------------------------

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            /// Canonical lowercase hyphenated form used in storage and on the wire.
            pub fn encode(&self) -> String {
                self.0.hyphenated().to_string()
            }

            pub fn decode(raw: &str) -> std::result::Result<Self, IdentifierError> {
                Uuid::parse_str(raw)
                    .map(Self)
                    .map_err(|source| IdentifierError::Invalid {
                        kind: $kind,
                        value: raw.to_string(),
                        source,
                    })
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = IdentifierError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Self::decode(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.encode())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::decode(&raw).map_err(de::Error::custom)
            }
        }
    };
}

identifier!(
    /// Flash sale the item was sold in.
    FlashId,
    "flashID"
);
identifier!(
    /// Inventory item that was sold.
    ItemId,
    "itemID"
);
identifier!(
    /// Sale transaction the item belongs to.
    SaleId,
    "saleID"
);
identifier!(
    /// Generated once per report; never reused.
    ReportId,
    "reportID"
);

// ---------------------------------------------------------------------------
// Surrogate key assigned by the document store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DocumentId(i64);

impl DocumentId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn decode(raw: &str) -> std::result::Result<Self, IdentifierError> {
        raw.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| IdentifierError::InvalidDocumentId(raw.to_string()))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // The store hands keys back natively; older exports carry them as strings.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawDocumentId {
            Native(i64),
            Text(String),
        }

        match RawDocumentId::deserialize(deserializer)? {
            RawDocumentId::Native(id) => Ok(Self(id)),
            RawDocumentId::Text(raw) => Self::decode(&raw).map_err(de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Filter parameters
// ---------------------------------------------------------------------------

/// Two-sided comparator against an integer field. A missing bound stays `None`
/// so validation can tell "absent" apart from an explicit value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparator {
    #[serde(rename = "$gt", default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<i64>,
    #[serde(rename = "$lt", default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<i64>,
}

impl Comparator {
    /// Fields present in `later` win; absent ones keep the earlier value.
    fn merge(self, later: Comparator) -> Comparator {
        Comparator {
            gt: later.gt.or(self.gt),
            lt: later.lt.or(self.lt),
        }
    }
}

/// Report filter as received in a query event and embedded in a stored report.
///
/// Wire shape: `{"timestamp":{"$gt":<int>,"$lt":<int>}}`. Producers also emit the
/// bounds as two separate `timestamp` keys; those are merged into one comparator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoldItemParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Comparator>,
}

impl SoldItemParams {
    pub fn between(gt: i64, lt: i64) -> Self {
        Self {
            timestamp: Some(Comparator { gt: Some(gt), lt: Some(lt) }),
        }
    }
}

impl<'de> Deserialize<'de> for SoldItemParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ParamsVisitor;

        impl<'de> Visitor<'de> for ParamsVisitor {
            type Value = SoldItemParams;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sold-item filter object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut timestamp: Option<Comparator> = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "timestamp" {
                        if let Some(next) = map.next_value::<Option<Comparator>>()? {
                            timestamp = Some(match timestamp {
                                Some(prev) => prev.merge(next),
                                None => next,
                            });
                        }
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
                Ok(SoldItemParams { timestamp })
            }
        }

        deserializer.deserialize_map(ParamsVisitor)
    }
}

// ---------------------------------------------------------------------------
// Report rows
// ---------------------------------------------------------------------------

/// One row per distinct `(sku, name)` pair in the filtered window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResult {
    pub sku: String,
    pub name: String,
    /// Average `weight` across the matching sold items.
    pub sold_weight: f64,
    /// Average `totalWeight` across the matching sold items.
    pub total_weight: f64,
}
