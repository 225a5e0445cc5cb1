//! One-shot fetch execution.

use tracing::trace;

use lodestone_store::{DocumentStore, StructuredQuery};

use crate::coordinator::CacheCoordinator;
use crate::document::{Document, ReadBehavior};
use crate::error::SyncError;

/// Execute a query once and return the materialized documents in order.
///
/// Each document is written through to its own document-level cache entry
/// as a side effect, so a later single-document read observes the latest
/// value without a round trip. The collection-level entry is NOT written
/// here; that is the coordinator's job with the returned value. Failures
/// surface to the caller unretried.
pub(crate) async fn fetch_collection<S: DocumentStore>(
    store: &S,
    coordinator: &CacheCoordinator,
    path: &str,
    query: &StructuredQuery,
    behavior: &ReadBehavior,
) -> Result<Vec<Document>, SyncError> {
    let raw = store.run_query(path, query).await?;
    let documents: Vec<Document> = raw
        .into_iter()
        .map(|r| Document::from_raw(r, behavior))
        .collect();

    for doc in &documents {
        coordinator.write_document(doc.clone());
    }

    trace!(path = %path, documents = documents.len(), "fetch executed");
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_store::{FieldFilter, FilterOp, MemoryStore, OrderBy};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_ordered_documents() {
        let store = MemoryStore::new();
        store.seed("users", "a", fields(json!({"name": "Ada", "age": 36})));
        store.seed("users", "b", fields(json!({"name": "Bob", "age": 17})));
        let coordinator = CacheCoordinator::new();

        let query = StructuredQuery {
            filters: vec![FieldFilter::new("age", FilterOp::GreaterThanOrEqual, 18)],
            order_by: vec![OrderBy::asc("name")],
            ..Default::default()
        };
        let docs = fetch_collection(
            &store,
            &coordinator,
            "users",
            &query,
            &ReadBehavior::default(),
        )
        .await
        .unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "a");
    }

    #[tokio::test]
    async fn test_fetch_writes_documents_through() {
        let store = MemoryStore::new();
        store.seed("users", "a", fields(json!({"name": "Ada"})));
        let coordinator = CacheCoordinator::new();

        fetch_collection(
            &store,
            &coordinator,
            "users",
            &StructuredQuery::default(),
            &ReadBehavior::default(),
        )
        .await
        .unwrap();

        let cached = coordinator.document("users/a").unwrap();
        assert_eq!(cached.data["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_fetch_does_not_write_the_collection_entry() {
        let store = MemoryStore::new();
        store.seed("users", "a", fields(json!({"name": "Ada"})));
        let coordinator = CacheCoordinator::new();

        fetch_collection(
            &store,
            &coordinator,
            "users",
            &StructuredQuery::default(),
            &ReadBehavior::default(),
        )
        .await
        .unwrap();

        // Only the document write-through happened.
        assert_eq!(coordinator.cache().len(), 1);
    }
}
