//! Query normalization and canonical key derivation.
//!
//! Filter and ordering clauses may be given as a single item or a list of
//! items. The distinction is carried by explicit wrapper enums rather than
//! inspected structurally, so a filter value that is itself an array can
//! never be mistaken for a list of filters. Normalization wraps lone items
//! into one-element lists; the clause order itself is preserved because it
//! affects query semantics.

use serde_json::Value;

use lodestone_store::{FieldFilter, FilterOp, OrderBy, StructuredQuery};

use crate::error::SyncError;

/// One filter, or several.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereSpec {
    One(FieldFilter),
    Many(Vec<FieldFilter>),
}

impl From<FieldFilter> for WhereSpec {
    fn from(filter: FieldFilter) -> Self {
        WhereSpec::One(filter)
    }
}

impl From<Vec<FieldFilter>> for WhereSpec {
    fn from(filters: Vec<FieldFilter>) -> Self {
        WhereSpec::Many(filters)
    }
}

impl WhereSpec {
    fn into_clauses(self) -> Vec<FieldFilter> {
        match self {
            WhereSpec::One(filter) => vec![filter],
            WhereSpec::Many(filters) => filters,
        }
    }
}

/// One ordering clause, several, or a bare field name (ascending).
#[derive(Debug, Clone, PartialEq)]
pub enum OrderSpec {
    Field(String),
    One(OrderBy),
    Many(Vec<OrderBy>),
}

impl From<&str> for OrderSpec {
    fn from(field: &str) -> Self {
        OrderSpec::Field(field.to_string())
    }
}

impl From<String> for OrderSpec {
    fn from(field: String) -> Self {
        OrderSpec::Field(field)
    }
}

impl From<OrderBy> for OrderSpec {
    fn from(order: OrderBy) -> Self {
        OrderSpec::One(order)
    }
}

impl From<Vec<OrderBy>> for OrderSpec {
    fn from(orders: Vec<OrderBy>) -> Self {
        OrderSpec::Many(orders)
    }
}

impl OrderSpec {
    fn into_clauses(self) -> Vec<OrderBy> {
        match self {
            OrderSpec::Field(field) => vec![OrderBy::asc(field)],
            OrderSpec::One(order) => vec![order],
            OrderSpec::Many(orders) => orders,
        }
    }
}

/// Options for reading a collection.
///
/// `filter`, `order_by`, `limit`, the cursor bounds, and `collection_group`
/// are identity-bearing: they go into the canonical key. `listen`,
/// `parse_dates`, and `keep_snapshots` are behavior configuration: they are
/// deliberately excluded from the key so that changing how results are
/// delivered or parsed never fragments the cache.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub filter: Option<WhereSpec>,
    pub order_by: Option<OrderSpec>,
    pub limit: Option<u32>,
    pub start_at: Option<Value>,
    pub start_after: Option<Value>,
    pub end_at: Option<Value>,
    pub end_before: Option<Value>,
    pub collection_group: bool,
    /// Back the collection with a live subscription instead of one-shot
    /// fetches.
    pub listen: bool,
    /// Field paths (dot-separated for nesting) coerced into a canonical
    /// temporal representation on ingest.
    pub parse_dates: Vec<String>,
    /// Retain the raw store document on each record. Forfeits plain-data
    /// serializability of the cached value.
    pub keep_snapshots: bool,
}

impl QueryOptions {
    /// Split into the identity-bearing descriptor and nothing else; the
    /// behavior fields are read separately by the caller.
    pub(crate) fn to_descriptor(&self) -> StructuredQuery {
        StructuredQuery {
            filters: self
                .filter
                .clone()
                .map(WhereSpec::into_clauses)
                .unwrap_or_default(),
            order_by: self
                .order_by
                .clone()
                .map(OrderSpec::into_clauses)
                .unwrap_or_default(),
            limit: self.limit,
            start_at: self.start_at.clone(),
            start_after: self.start_after.clone(),
            end_at: self.end_at.clone(),
            end_before: self.end_before.clone(),
            collection_group: self.collection_group,
        }
    }

    /// Convenience: a single `(field, op, value)` filter.
    pub fn where_field(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<Value>,
    ) -> Self {
        let filter = FieldFilter::new(field, op, value);
        self.filter = Some(match self.filter.take() {
            None => WhereSpec::One(filter),
            Some(spec) => {
                let mut clauses = spec.into_clauses();
                clauses.push(filter);
                WhereSpec::Many(clauses)
            }
        });
        self
    }

    pub fn order_by(mut self, order: impl Into<OrderSpec>) -> Self {
        self.order_by = Some(order.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }
}

/// Derive the canonical cache key for a query against a collection path.
///
/// Two keys are equal iff their serialized descriptors are byte-identical;
/// the serialization covers the full descriptor including scope and cursor
/// bounds.
pub fn canonical_key(path: &str, descriptor: &StructuredQuery) -> Result<String, SyncError> {
    let serialized = serde_json::to_string(descriptor).map_err(SyncError::MalformedQuery)?;
    Ok(format!("{}|{}", path, serialized))
}
