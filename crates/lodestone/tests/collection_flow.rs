//! End-to-end flows over the in-memory store: fetch, live subscription,
//! optimistic adds, mode flips, dedup, and error surfacing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::Notify;

use lodestone::{AddResult, CacheConfig, Client, Document, QueryOptions, Signal, SyncError};
use lodestone_store::{
    DocumentStore, FilterOp, ListenOptions, MemoryStore, RawDocument, StoreError, StructuredQuery,
    Subscription, WriteOp,
};

fn fields(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// MemoryStore wrapper that counts operations, can fail queries on demand,
/// slow them down, and hold commits until released.
struct InstrumentedStore {
    inner: MemoryStore,
    queries: AtomicUsize,
    listens: AtomicUsize,
    doc_gets: AtomicUsize,
    fail_queries: AtomicBool,
    fail_commits: AtomicBool,
    query_delay: Option<Duration>,
    commit_gate: Option<Arc<Notify>>,
}

impl InstrumentedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            queries: AtomicUsize::new(0),
            listens: AtomicUsize::new(0),
            doc_gets: AtomicUsize::new(0),
            fail_queries: AtomicBool::new(false),
            fail_commits: AtomicBool::new(false),
            query_delay: None,
            commit_gate: None,
        }
    }

    fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }

    /// Commits block until the returned gate is notified.
    fn with_held_commits(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.commit_gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn listen_count(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InstrumentedStore {
    async fn run_query(
        &self,
        path: &str,
        query: &StructuredQuery,
    ) -> Result<Vec<RawDocument>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.query_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Remote {
                status: 500,
                message: "store offline".to_string(),
            });
        }
        self.inner.run_query(path, query).await
    }

    async fn get_document(&self, path: &str) -> Result<RawDocument, StoreError> {
        self.doc_gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_document(path).await
    }

    async fn listen(
        &self,
        path: &str,
        query: &StructuredQuery,
        options: ListenOptions,
    ) -> Result<Subscription, StoreError> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        self.inner.listen(path, query, options).await
    }

    fn generate_id(&self, collection_path: &str) -> String {
        self.inner.generate_id(collection_path)
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        if let Some(gate) = &self.commit_gate {
            gate.notified().await;
        }
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Remote {
                status: 503,
                message: "write rejected".to_string(),
            });
        }
        self.inner.commit(writes).await
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_filtered_ordered_limited_fetch() {
    let store = MemoryStore::new();
    store.seed("users", "w", fields(json!({"name": "Wilkes", "age": 34})));
    store.seed("users", "x", fields(json!({"name": "Ada", "age": 36})));
    store.seed("users", "y", fields(json!({"name": "Bob", "age": 17})));
    store.seed("users", "z", fields(json!({"name": "Curry", "age": 54})));

    let client = Client::new(store);
    let collection = client
        .collection(
            Some("users"),
            QueryOptions::default()
                .where_field("age", FilterOp::GreaterThanOrEqual, 21)
                .order_by("name")
                .limit(2),
        )
        .await
        .unwrap();

    let data = collection.data().unwrap();
    assert_eq!(data.len(), 2);
    let names: Vec<&Value> = data.iter().map(|d| &d.data["name"]).collect();
    assert_eq!(names, vec![&json!("Ada"), &json!("Curry")]);
    assert!(data.iter().all(|d| d.exists && !d.has_pending_writes));
}

#[tokio::test]
async fn test_deferred_path_makes_no_remote_calls() {
    let client = Client::new(InstrumentedStore::new());
    let collection = client
        .collection(None, QueryOptions::default())
        .await
        .unwrap();

    assert!(collection.data().is_none());
    assert!(collection.error().is_none());
    assert_eq!(client.store().query_count(), 0);
    assert_eq!(client.store().listen_count(), 0);
}

#[tokio::test]
async fn test_fetch_fans_documents_out_to_their_own_keys() {
    let store = MemoryStore::new();
    store.seed("users", "a", fields(json!({"name": "Ada"})));
    store.seed("users", "b", fields(json!({"name": "Bob"})));

    let client = Client::new(store);
    let collection = client
        .collection(Some("users"), QueryOptions::default())
        .await
        .unwrap();

    for doc in collection.data().unwrap().iter() {
        let cached = client
            .coordinator()
            .document(&doc.path)
            .unwrap_or_else(|| panic!("no document entry for {}", doc.path));
        assert_eq!(cached.data, doc.data);
    }
}

#[tokio::test]
async fn test_document_read_after_fetch_skips_the_store() {
    let store = InstrumentedStore::new();
    store.inner.seed("users", "a", fields(json!({"name": "Ada"})));

    let client = Client::new(store);
    client
        .collection(Some("users"), QueryOptions::default())
        .await
        .unwrap();

    let doc = client.document("users/a").await.unwrap();
    assert_eq!(doc.data["name"], json!("Ada"));
    assert_eq!(client.store().doc_gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_optimistic_add_is_visible_before_confirmation() {
    let (store, gate) = InstrumentedStore::new().with_held_commits();
    let client = Client::new(store);

    let collection = Arc::new(
        client
            .collection(Some("users"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(collection.data().unwrap().len(), 0);

    let adder = {
        let collection = Arc::clone(&collection);
        tokio::spawn(async move { collection.add(fields(json!({"name": "Ada"}))).await })
    };

    // The optimistic record lands before the remote write confirms.
    wait_until("optimistic append", || {
        collection.data().is_some_and(|d| d.len() == 1)
    })
    .await;
    let optimistic = collection.data().unwrap()[0].clone();
    assert_eq!(optimistic.data["name"], json!("Ada"));
    assert!(optimistic.has_pending_writes);
    assert!(!optimistic.id.is_empty());

    gate.notify_one();
    let result = adder.await.unwrap().unwrap();
    assert_eq!(result, AddResult::One(optimistic.id));
}

#[tokio::test]
async fn test_add_many_yields_n_plus_m_with_matching_ids() {
    let (store, gate) = InstrumentedStore::new().with_held_commits();
    store.inner.seed("users", "a", fields(json!({"name": "Ada"})));
    store.inner.seed("users", "b", fields(json!({"name": "Bob"})));

    let client = Client::new(store);
    let collection = Arc::new(
        client
            .collection(Some("users"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(collection.data().unwrap().len(), 2);

    let adder = {
        let collection = Arc::clone(&collection);
        tokio::spawn(async move {
            collection
                .add(vec![
                    fields(json!({"name": "Grace"})),
                    fields(json!({"name": "Edsger"})),
                    fields(json!({"name": "Barbara"})),
                ])
                .await
        })
    };

    wait_until("optimistic appends", || {
        collection.data().is_some_and(|d| d.len() == 5)
    })
    .await;
    let appended_ids: Vec<String> = collection.data().unwrap()[2..]
        .iter()
        .map(|d| d.id.clone())
        .collect();

    gate.notify_one();
    match adder.await.unwrap().unwrap() {
        AddResult::Many(ids) => {
            // Resolution ids match the optimistic records, in order.
            assert_eq!(ids, appended_ids);
            // And the committed documents exist under exactly those ids.
            for id in &ids {
                let doc = client.store().inner.get_document(&format!("users/{id}")).await.unwrap();
                assert!(doc.exists);
            }
        }
        AddResult::One(_) => panic!("expected list result for list input"),
    }
}

#[tokio::test]
async fn test_failed_batch_write_leaves_optimistic_append_in_place() {
    let store = InstrumentedStore::new();
    store.fail_commits.store(true, Ordering::SeqCst);
    let client = Client::new(store);

    let collection = client
        .collection(Some("users"), QueryOptions::default())
        .await
        .unwrap();

    let err = collection
        .add(fields(json!({"name": "Ada"})))
        .await
        .unwrap_err();

    // The error carries the pre-assigned ids so a caller can compensate
    // by identity; the engine itself rolls nothing back.
    let SyncError::BatchWrite { ids, .. } = err else {
        panic!("expected batch write error");
    };
    assert_eq!(ids.len(), 1);

    let data = collection.data().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].id, ids[0]);
    assert!(data[0].has_pending_writes);
}

#[tokio::test]
async fn test_listen_flip_fires_exactly_one_revalidation() {
    let store = InstrumentedStore::new();
    let client = Client::new(store);

    let collection = client
        .collection(Some("users"), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(client.store().query_count(), 1);
    assert_eq!(client.store().listen_count(), 0);

    collection.set_listen(true).await;
    assert_eq!(client.store().query_count(), 1);
    assert_eq!(client.store().listen_count(), 1);
    assert!(collection.is_listening());

    // Setting the current mode again is not a flip.
    collection.set_listen(true).await;
    assert_eq!(client.store().listen_count(), 1);

    collection.set_listen(false).await;
    assert_eq!(client.store().query_count(), 2);
    assert_eq!(client.store().listen_count(), 1);
    assert!(!collection.is_listening());
}

#[tokio::test]
async fn test_live_mode_receives_push_updates() {
    let store = MemoryStore::new();
    let client = Client::new(store);

    let collection = client
        .collection(Some("users"), QueryOptions::default().listen(true))
        .await
        .unwrap();
    assert_eq!(collection.data().unwrap().len(), 0);

    client
        .store()
        .remote_set("users", "a", fields(json!({"name": "Ada"})))
        .await;

    wait_until("push update", || {
        collection.data().is_some_and(|d| d.len() == 1)
    })
    .await;
    assert_eq!(collection.data().unwrap()[0].id, "a");
}

#[tokio::test]
async fn test_add_in_live_mode_does_not_double_count() {
    let store = MemoryStore::new();
    let client = Client::new(store);

    let collection = client
        .collection(Some("users"), QueryOptions::default().listen(true))
        .await
        .unwrap();

    let result = collection
        .add(fields(json!({"name": "Ada"})))
        .await
        .unwrap();
    let AddResult::One(id) = result else {
        panic!("expected single id");
    };

    // The push delivery is authoritative: exactly one record appears.
    wait_until("push-delivered add", || {
        collection.data().is_some_and(|d| d.len() == 1)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let data = collection.data().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].id, id);
}

#[tokio::test]
async fn test_failed_revalidation_keeps_stale_data_visible() {
    let store = InstrumentedStore::new();
    store.inner.seed("users", "a", fields(json!({"name": "Ada"})));
    let client = Client::new(store);

    let collection = client
        .collection(Some("users"), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(collection.data().unwrap().len(), 1);
    assert!(collection.error().is_none());

    client.store().fail_queries.store(true, Ordering::SeqCst);
    collection.revalidate().await;

    let error = collection.error().expect("error should surface");
    assert!(matches!(
        &*error,
        SyncError::Store(StoreError::Remote { status: 500, .. })
    ));
    // Stale data stays visible until a valid revalidation succeeds.
    assert_eq!(collection.data().unwrap().len(), 1);

    client.store().fail_queries.store(false, Ordering::SeqCst);
    collection.revalidate().await;
    assert!(collection.error().is_none());
}

#[tokio::test]
async fn test_concurrent_revalidations_share_one_fetch() {
    let store = InstrumentedStore::new().with_query_delay(Duration::from_millis(50));
    let client = Client::new(store);

    let collection = client
        .collection(Some("users"), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(client.store().query_count(), 1);

    tokio::join!(
        collection.revalidate(),
        collection.revalidate(),
        collection.revalidate(),
    );

    // One owner ran the fetch; the other two joined it.
    assert_eq!(client.store().query_count(), 2);
}

#[tokio::test]
async fn test_reconnect_signal_revalidates_only_in_poll_mode() {
    let store = InstrumentedStore::new();
    let client = Client::new(store);

    let collection = client
        .collection_with_config(
            Some("users"),
            QueryOptions::default(),
            CacheConfig::default().with_dedup_window(Duration::ZERO),
        )
        .await
        .unwrap();
    assert_eq!(client.store().query_count(), 1);

    client.signals().emit(Signal::Reconnect);
    wait_until("ambient revalidation", || {
        client.store().query_count() == 2
    })
    .await;

    collection.set_listen(true).await;
    assert_eq!(client.store().listen_count(), 1);

    // Live mode: ambient signals are disabled entirely.
    client.signals().emit(Signal::Reconnect);
    client.signals().emit(Signal::Focus);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.store().query_count(), 2);
    assert_eq!(client.store().listen_count(), 1);
}

#[tokio::test]
async fn test_poll_interval_revalidates_in_poll_mode() {
    let store = InstrumentedStore::new();
    let client = Client::new(store);

    let _collection = client
        .collection_with_config(
            Some("users"),
            QueryOptions::default(),
            CacheConfig::default()
                .with_poll_interval(Duration::from_millis(30))
                .with_dedup_window(Duration::ZERO),
        )
        .await
        .unwrap();
    assert_eq!(client.store().query_count(), 1);

    wait_until("poll-driven revalidations", || {
        client.store().query_count() >= 3
    })
    .await;
}

#[tokio::test]
async fn test_changed_wakes_on_push_update() {
    let store = MemoryStore::new();
    let client = Client::new(store);

    let collection = Arc::new(
        client
            .collection(Some("users"), QueryOptions::default().listen(true))
            .await
            .unwrap(),
    );

    let waiter = {
        let collection = Arc::clone(&collection);
        tokio::spawn(async move {
            collection.changed().await;
        })
    };
    // Let the waiter subscribe before pushing.
    tokio::time::sleep(Duration::from_millis(20)).await;

    client
        .store()
        .remote_set("users", "a", fields(json!({"name": "Ada"})))
        .await;

    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("changed() should wake on push")
        .unwrap();
}

#[tokio::test]
async fn test_parse_dates_applies_through_the_full_flow() {
    let store = MemoryStore::new();
    store.seed(
        "events",
        "e1",
        fields(json!({"title": "launch", "at": 1700000000000_i64})),
    );
    let client = Client::new(store);

    let mut options = QueryOptions::default();
    options.parse_dates = vec!["at".to_string()];
    let collection = client
        .collection(Some("events"), options)
        .await
        .unwrap();

    let data = collection.data().unwrap();
    let parsed = data[0].date("at").expect("coerced date");
    assert_eq!(parsed.timestamp_millis(), 1700000000000);
}

#[tokio::test]
async fn test_mutate_replaces_wholesale() {
    let store = MemoryStore::new();
    store.seed("users", "a", fields(json!({"name": "Ada"})));
    let client = Client::new(store);

    let collection = client
        .collection(Some("users"), QueryOptions::default())
        .await
        .unwrap();

    collection
        .mutate(|current| {
            let mut docs: Vec<Document> = current.map(|d| (*d).clone()).unwrap_or_default();
            docs.clear();
            docs
        })
        .unwrap();

    assert_eq!(collection.data().unwrap().len(), 0);
}
