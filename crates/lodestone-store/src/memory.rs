//! In-memory document store.
//!
//! A complete in-process backend: per-collection ordered id maps, query
//! evaluation, and push delivery to live subscriptions on every commit.
//! This is the workspace's test backend, but it behaves like a real store:
//! local writes are first observable with a pending-write flag, then
//! confirmed with a metadata-only snapshot.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::id::generate_document_id;
use crate::store::{CancelHandle, DocumentStore, ListenOptions, SnapshotEvent, Subscription};
use crate::types::{
    Direction, FieldFilter, FilterOp, OrderBy, RawDocument, StructuredQuery, WriteOp,
    split_document_path,
};

/// Buffered snapshots per subscription before the store considers the
/// consumer too slow and drops the feed.
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct StoredDocument {
    fields: serde_json::Map<String, Value>,
    has_pending_writes: bool,
}

struct Watcher {
    path: String,
    query: StructuredQuery,
    options: ListenOptions,
    tx: mpsc::Sender<SnapshotEvent>,
    cancel: CancelHandle,
}

/// In-memory store backend.
pub struct MemoryStore {
    /// Collection path -> (document id -> document). BTreeMap keeps ids
    /// ordered, which doubles as the implicit ordering for queries without
    /// an `order_by`.
    collections: DashMap<String, BTreeMap<String, StoredDocument>>,
    /// Active subscriptions. Dead entries are swept on every notify pass.
    watchers: Mutex<Vec<Watcher>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Insert a confirmed document without notifying subscriptions.
    ///
    /// Fixture setup only; use [`MemoryStore::remote_set`] to simulate
    /// another client's write arriving over the wire.
    pub fn seed(
        &self,
        collection_path: &str,
        id: &str,
        fields: serde_json::Map<String, Value>,
    ) {
        self.collections
            .entry(collection_path.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredDocument {
                    fields,
                    has_pending_writes: false,
                },
            );
    }

    /// Apply a confirmed write as if another client had issued it, and push
    /// snapshots to affected subscriptions.
    pub async fn remote_set(
        &self,
        collection_path: &str,
        id: &str,
        fields: serde_json::Map<String, Value>,
    ) {
        self.seed(collection_path, id, fields);
        self.notify_watchers(false).await;
    }

    /// Delete a document as if another client had issued it.
    pub async fn remote_delete(&self, collection_path: &str, id: &str) {
        if let Some(mut collection) = self.collections.get_mut(collection_path) {
            collection.remove(id);
        }
        self.notify_watchers(false).await;
    }

    /// Number of documents currently stored under a collection path.
    pub fn len(&self, collection_path: &str) -> usize {
        self.collections
            .get(collection_path)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection_path: &str) -> bool {
        self.len(collection_path) == 0
    }

    /// Evaluate a query against current state.
    fn evaluate(&self, path: &str, query: &StructuredQuery) -> Vec<RawDocument> {
        let mut docs: Vec<RawDocument> = Vec::new();

        if query.collection_group {
            // A group query addresses every collection whose id (last path
            // segment) matches, at any depth.
            for entry in self.collections.iter() {
                let collection_path = entry.key();
                if collection_path == path
                    || collection_path.ends_with(&format!("/{}", path))
                {
                    collect_documents(collection_path, entry.value(), &mut docs);
                }
            }
            // Cross-collection results need a deterministic base order.
            docs.sort_by(|a, b| a.path().cmp(&b.path()));
        } else if let Some(collection) = self.collections.get(path) {
            collect_documents(path, collection.value(), &mut docs);
        }

        docs.retain(|doc| query.filters.iter().all(|f| matches_filter(doc, f)));

        if !query.order_by.is_empty() {
            // Documents missing an ordered field drop out of the result set.
            docs.retain(|doc| query.order_by.iter().all(|o| doc.fields.contains_key(&o.field)));
            docs.sort_by(|a, b| compare_by_order(a, b, &query.order_by));
        }

        apply_cursors(&mut docs, query);

        if let Some(limit) = query.limit {
            docs.truncate(limit as usize);
        }

        docs
    }

    /// Push fresh snapshots to every live subscription.
    ///
    /// `metadata_only` marks a pass where field data did not change (a
    /// pending-write flag flipped); watchers that opted out of metadata
    /// changes are skipped.
    async fn notify_watchers(&self, metadata_only: bool) {
        let mut watchers = self.watchers.lock().await;
        let mut dead = Vec::new();

        for (i, watcher) in watchers.iter().enumerate() {
            if watcher.cancel.is_cancelled() || watcher.tx.is_closed() {
                dead.push(i);
                continue;
            }
            if metadata_only && !watcher.options.include_metadata_changes {
                continue;
            }

            let snapshot = self.evaluate(&watcher.path, &watcher.query);
            match watcher.tx.try_send(SnapshotEvent::Snapshot(snapshot)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(path = %watcher.path, "subscription buffer full, dropping feed");
                    dead.push(i);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(i),
            }
        }

        for i in dead.into_iter().rev() {
            watchers.swap_remove(i);
        }
    }
}

fn collect_documents(
    collection_path: &str,
    collection: &BTreeMap<String, StoredDocument>,
    out: &mut Vec<RawDocument>,
) {
    for (id, doc) in collection {
        out.push(RawDocument {
            id: id.clone(),
            parent: collection_path.to_string(),
            exists: true,
            has_pending_writes: doc.has_pending_writes,
            fields: doc.fields.clone(),
        });
    }
}

/// Total order over JSON values: null < bool < number < string < array.
///
/// Objects are not orderable and compare equal; they only matter for
/// equality filters.
fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = compare_values(xv, yv);
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn matches_filter(doc: &RawDocument, filter: &FieldFilter) -> bool {
    let field = doc.fields.get(&filter.field);

    match filter.op {
        FilterOp::Equal => field == Some(&filter.value),
        // Inequality ops never match a missing field.
        FilterOp::NotEqual => field.is_some_and(|v| v != &filter.value),
        FilterOp::LessThan => {
            field.is_some_and(|v| compare_values(v, &filter.value) == CmpOrdering::Less)
        }
        FilterOp::LessThanOrEqual => {
            field.is_some_and(|v| compare_values(v, &filter.value) != CmpOrdering::Greater)
        }
        FilterOp::GreaterThan => {
            field.is_some_and(|v| compare_values(v, &filter.value) == CmpOrdering::Greater)
        }
        FilterOp::GreaterThanOrEqual => {
            field.is_some_and(|v| compare_values(v, &filter.value) != CmpOrdering::Less)
        }
        FilterOp::ArrayContains => match field {
            Some(Value::Array(items)) => items.contains(&filter.value),
            _ => false,
        },
        FilterOp::In => match &filter.value {
            Value::Array(options) => field.is_some_and(|v| options.contains(v)),
            _ => false,
        },
        FilterOp::NotIn => match &filter.value {
            Value::Array(options) => field.is_some_and(|v| !options.contains(v)),
            _ => false,
        },
        FilterOp::ArrayContainsAny => match (field, &filter.value) {
            (Some(Value::Array(items)), Value::Array(options)) => {
                items.iter().any(|item| options.contains(item))
            }
            _ => false,
        },
    }
}

fn compare_by_order(a: &RawDocument, b: &RawDocument, order_by: &[OrderBy]) -> CmpOrdering {
    for clause in order_by {
        let av = a.fields.get(&clause.field).unwrap_or(&Value::Null);
        let bv = b.fields.get(&clause.field).unwrap_or(&Value::Null);
        let ord = match clause.direction {
            Direction::Asc => compare_values(av, bv),
            Direction::Desc => compare_values(bv, av),
        };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    // Stable tiebreak on id.
    a.id.cmp(&b.id)
}

/// Apply start/end cursor bounds against the first ordering field.
fn apply_cursors(docs: &mut Vec<RawDocument>, query: &StructuredQuery) {
    let has_cursor = query.start_at.is_some()
        || query.start_after.is_some()
        || query.end_at.is_some()
        || query.end_before.is_some();
    if !has_cursor {
        return;
    }

    let Some(first_order) = query.order_by.first() else {
        debug!("cursor bounds without an order_by clause are ignored");
        return;
    };

    let field = &first_order.field;
    let direction = first_order.direction;

    let position = |doc: &RawDocument, cursor: &Value| -> CmpOrdering {
        let v = doc.fields.get(field).unwrap_or(&Value::Null);
        match direction {
            Direction::Asc => compare_values(v, cursor),
            Direction::Desc => compare_values(cursor, v),
        }
    };

    docs.retain(|doc| {
        if let Some(cursor) = &query.start_at {
            if position(doc, cursor) == CmpOrdering::Less {
                return false;
            }
        }
        if let Some(cursor) = &query.start_after {
            if position(doc, cursor) != CmpOrdering::Greater {
                return false;
            }
        }
        if let Some(cursor) = &query.end_at {
            if position(doc, cursor) == CmpOrdering::Greater {
                return false;
            }
        }
        if let Some(cursor) = &query.end_before {
            if position(doc, cursor) != CmpOrdering::Less {
                return false;
            }
        }
        true
    });
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn run_query(
        &self,
        path: &str,
        query: &StructuredQuery,
    ) -> Result<Vec<RawDocument>, StoreError> {
        Ok(self.evaluate(path, query))
    }

    async fn get_document(&self, path: &str) -> Result<RawDocument, StoreError> {
        let (parent, id) = split_document_path(path)
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;

        let doc = self
            .collections
            .get(parent)
            .and_then(|c| c.get(id).cloned());

        Ok(match doc {
            Some(stored) => RawDocument {
                id: id.to_string(),
                parent: parent.to_string(),
                exists: true,
                has_pending_writes: stored.has_pending_writes,
                fields: stored.fields,
            },
            // Missing documents read back as nonexistent, not as errors.
            None => RawDocument {
                id: id.to_string(),
                parent: parent.to_string(),
                exists: false,
                has_pending_writes: false,
                fields: serde_json::Map::new(),
            },
        })
    }

    async fn listen(
        &self,
        path: &str,
        query: &StructuredQuery,
        options: ListenOptions,
    ) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (cancel, _cancel_rx) = CancelHandle::new();

        // First event is always the current result set.
        let initial = self.evaluate(path, query);
        tx.try_send(SnapshotEvent::Snapshot(initial))
            .map_err(|_| StoreError::WebSocket("subscription buffer full".to_string()))?;

        trace!(path = %path, "memory store subscription opened");

        self.watchers.lock().await.push(Watcher {
            path: path.to_string(),
            query: query.clone(),
            options,
            tx,
            cancel: cancel.clone(),
        });

        Ok(Subscription { events: rx, cancel })
    }

    fn generate_id(&self, _collection_path: &str) -> String {
        generate_document_id()
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        // Validate every path before touching state so the batch stays atomic.
        let mut parsed: Vec<(String, String, Option<serde_json::Map<String, Value>>)> =
            Vec::with_capacity(writes.len());
        for write in &writes {
            let (parent, id) = split_document_path(write.path())
                .ok_or_else(|| StoreError::InvalidPath(write.path().to_string()))?;
            let fields = match write {
                WriteOp::Set { fields, .. } => Some(fields.clone()),
                WriteOp::Delete { .. } => None,
            };
            parsed.push((parent.to_string(), id.to_string(), fields));
        }

        // Phase 1: apply with pending-write flags and push the data change.
        for (parent, id, fields) in &parsed {
            let mut collection = self.collections.entry(parent.clone()).or_default();
            match fields {
                Some(fields) => {
                    collection.insert(
                        id.clone(),
                        StoredDocument {
                            fields: fields.clone(),
                            has_pending_writes: true,
                        },
                    );
                }
                None => {
                    collection.remove(id);
                }
            }
        }
        self.notify_watchers(false).await;

        // Phase 2: confirm, then push the metadata-only change.
        for (parent, id, fields) in &parsed {
            if fields.is_some()
                && let Some(mut collection) = self.collections.get_mut(parent)
                && let Some(doc) = collection.get_mut(id)
            {
                doc.has_pending_writes = false;
            }
        }
        self.notify_watchers(true).await;

        debug!(writes = writes.len(), "memory store commit applied");
        Ok(())
    }
}
