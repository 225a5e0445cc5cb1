//! Wire and data model types shared by all store drivers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator for a field filter.
///
/// Serialized forms match the wire protocol (`"=="`, `"<"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
    #[serde(rename = "array-contains-any")]
    ArrayContainsAny,
}

/// A single `(field, operator, value)` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

/// Sort direction for an ordering clause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// A single `(field, direction)` ordering clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// A fully specified query against one collection or collection group.
///
/// Filter and ordering clauses keep their given order: it affects query
/// semantics. Every field is always serialized so that two semantically
/// identical queries produce byte-identical serializations regardless of
/// how they were constructed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Value>,
    pub start_after: Option<Value>,
    pub end_at: Option<Value>,
    pub end_before: Option<Value>,
    /// Query a collection group (every collection with this id, at any depth)
    /// instead of a single collection path.
    pub collection_group: bool,
}

/// A raw document as delivered by a store driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDocument {
    /// Document id (last path segment).
    pub id: String,
    /// Collection path the document lives in.
    pub parent: String,
    /// Whether the document exists in the backing store.
    pub exists: bool,
    /// True while a locally issued write has not been confirmed.
    pub has_pending_writes: bool,
    /// Field data.
    pub fields: serde_json::Map<String, Value>,
}

impl RawDocument {
    /// Full document path (`"{parent}/{id}"`).
    pub fn path(&self) -> String {
        format!("{}/{}", self.parent, self.id)
    }
}

/// A single write in an atomic batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteOp {
    /// Create or replace the document at `path`.
    Set {
        path: String,
        fields: serde_json::Map<String, Value>,
    },
    /// Delete the document at `path`.
    Delete { path: String },
}

impl WriteOp {
    pub fn path(&self) -> &str {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Delete { path } => path,
        }
    }
}

/// Split a document path into its parent collection path and document id.
pub fn split_document_path(path: &str) -> Option<(&str, &str)> {
    let (parent, id) = path.rsplit_once('/')?;
    if parent.is_empty() || id.is_empty() {
        return None;
    }
    Some((parent, id))
}
