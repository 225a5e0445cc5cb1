//! Cache coordination: propagation rules and in-flight dedup.
//!
//! The coordinator owns the shared request cache and the rules that keep
//! collection-level and document-level entries coherent:
//!
//! - **Fan-out (down)**: writing a collection entry write-throughs every
//!   contained document into its own document-level key
//! - **Known-queries registry**: every resolved (path, key) pair is
//!   recorded so a document-level mutation can invalidate all collection
//!   entries that might contain it
//! - **In-flight dedup**: at most one fetch/subscribe runs per key;
//!   concurrent requests join the winner

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, trace};

use lodestone_cache::RequestCache;

use crate::document::Document;
use crate::error::SyncError;

/// A value in the shared request cache: a collection result set or a
/// single document.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Collection(Arc<Vec<Document>>),
    Document(Arc<Document>),
}

/// The engine's shared cache type.
pub type SyncCache = RequestCache<CachedValue, SyncError>;

/// Outcome of claiming the right to run an operation for a key.
pub enum InflightClaim {
    /// This caller runs the operation. Dropping the guard releases the key
    /// and wakes joined waiters.
    Owner(InflightGuard),
    /// Another operation is already in flight; await it instead.
    Joined(watch::Receiver<bool>),
}

/// Held by the single task running an operation for a key.
pub struct InflightGuard {
    key: String,
    table: Arc<DashMap<String, watch::Receiver<bool>>>,
    done_tx: watch::Sender<bool>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.table.remove(&self.key);
        // Wake joined waiters; fine if none are listening.
        let _ = self.done_tx.send(true);
    }
}

/// Await completion of an operation joined through
/// [`CacheCoordinator::claim_inflight`].
pub async fn await_inflight(mut done_rx: watch::Receiver<bool>) {
    while !*done_rx.borrow() {
        if done_rx.changed().await.is_err() {
            // Owner dropped without sending: the operation is over either way.
            return;
        }
    }
}

/// Owner of the shared cache and its propagation rules.
pub struct CacheCoordinator {
    cache: Arc<SyncCache>,
    /// Collection path -> canonical keys resolved for that path.
    known_queries: DashMap<String, HashSet<String>>,
    /// Keys with an operation currently in flight.
    inflight: Arc<DashMap<String, watch::Receiver<bool>>>,
}

impl CacheCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: SyncCache::new(),
            known_queries: DashMap::new(),
            inflight: Arc::new(DashMap::new()),
        })
    }

    pub fn cache(&self) -> &Arc<SyncCache> {
        &self.cache
    }

    /// Current collection entry value for a canonical key.
    pub fn collection(&self, key: &str) -> Option<Arc<Vec<Document>>> {
        match self.cache.get_value(key)? {
            CachedValue::Collection(docs) => Some(docs),
            CachedValue::Document(_) => None,
        }
    }

    /// Current document entry value for a document path.
    pub fn document(&self, path: &str) -> Option<Arc<Document>> {
        match self.cache.get_value(path)? {
            CachedValue::Document(doc) => Some(doc),
            CachedValue::Collection(_) => None,
        }
    }

    /// Write a collection entry, fanning each contained document out to
    /// its own document-level key.
    ///
    /// The fan-out writes never request revalidation. Callers that already
    /// hold fresher per-document state can disable the fan-out.
    pub fn write_collection(&self, key: &str, documents: Vec<Document>, fan_out: bool) {
        let documents = Arc::new(documents);
        self.cache
            .set(key, CachedValue::Collection(Arc::clone(&documents)), false);

        if fan_out {
            for doc in documents.iter() {
                self.write_document(doc.clone());
            }
        }
        trace!(key = %key, documents = documents.len(), fan_out, "collection entry written");
    }

    /// Write a single document entry (write-through), without requesting
    /// revalidation.
    pub fn write_document(&self, document: Document) {
        let path = document.path.clone();
        self.cache
            .set(&path, CachedValue::Document(Arc::new(document)), false);
    }

    /// Record a resolved (path, canonical key) pair.
    ///
    /// Called at the moment a fetch or subscription resolves, so that a
    /// later document-level mutation can reach every collection entry that
    /// might contain the document, even across independently created
    /// consumers.
    pub fn register_query(&self, path: &str, key: &str) {
        let inserted = self
            .known_queries
            .entry(path.to_string())
            .or_default()
            .insert(key.to_string());
        if inserted {
            debug!(path = %path, key = %key, "query registered");
        }
    }

    /// Canonical keys registered for a collection path.
    pub fn queries_for_path(&self, path: &str) -> Vec<String> {
        self.known_queries
            .get(path)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Invalidate every registered collection entry for a path.
    pub fn invalidate_path(&self, path: &str) {
        let keys = self.queries_for_path(path);
        debug!(path = %path, keys = keys.len(), "invalidating collection entries for path");
        for key in keys {
            self.cache.invalidate(&key);
        }
    }

    /// Claim the right to run the operation for a key.
    ///
    /// Consulted before starting any fetch or subscribe: if another
    /// operation is already in flight for the key, the caller receives a
    /// completion channel to await instead of starting a duplicate.
    pub fn claim_inflight(&self, key: &str) -> InflightClaim {
        use dashmap::mapref::entry::Entry;

        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => InflightClaim::Joined(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (done_tx, done_rx) = watch::channel(false);
                vacant.insert(done_rx);
                InflightClaim::Owner(InflightGuard {
                    key: key.to_string(),
                    table: Arc::clone(&self.inflight),
                    done_tx,
                })
            }
        }
    }

    /// Whether an operation is currently in flight for a key.
    pub fn has_inflight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Reset all state. Test harness use.
    pub fn reset(&self) {
        self.cache.clear();
        self.known_queries.clear();
        self.inflight.clear();
    }
}
