//! The public collection surface: client, handles, revalidation triggers,
//! and the optimistic mutation pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use lodestone_cache::{CacheConfig, CacheEvent, EventKind, Signal, SignalHub};
use lodestone_store::{DocumentStore, RawDocument, StructuredQuery, WriteOp, split_document_path};

use crate::coordinator::{CacheCoordinator, InflightClaim, await_inflight};
use crate::document::{Document, ReadBehavior};
use crate::error::SyncError;
use crate::fetch::fetch_collection;
use crate::listener::{ListenerHandle, ListenerRegistry};
use crate::query::{QueryOptions, canonical_key};

/// Documents to add: one, or an ordered list.
#[derive(Debug, Clone)]
pub enum AddPayload {
    One(serde_json::Map<String, Value>),
    Many(Vec<serde_json::Map<String, Value>>),
}

impl From<serde_json::Map<String, Value>> for AddPayload {
    fn from(fields: serde_json::Map<String, Value>) -> Self {
        AddPayload::One(fields)
    }
}

impl From<Vec<serde_json::Map<String, Value>>> for AddPayload {
    fn from(items: Vec<serde_json::Map<String, Value>>) -> Self {
        AddPayload::Many(items)
    }
}

/// Generated ids for an add, matching the input cardinality exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
    One(String),
    Many(Vec<String>),
}

impl AddResult {
    /// All generated ids, in input order.
    pub fn ids(&self) -> Vec<&str> {
        match self {
            AddResult::One(id) => vec![id.as_str()],
            AddResult::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// Process-wide sync service: one store, one shared cache.
///
/// Created once at application start and handed around; tests construct
/// isolated instances with their own coordinator.
pub struct Client<S: DocumentStore> {
    store: Arc<S>,
    coordinator: Arc<CacheCoordinator>,
    listeners: Arc<ListenerRegistry>,
    signals: Arc<SignalHub>,
}

impl<S: DocumentStore> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            listeners: Arc::clone(&self.listeners),
            signals: Arc::clone(&self.signals),
        }
    }
}

impl<S: DocumentStore> Client<S> {
    pub fn new(store: S) -> Self {
        Self::with_coordinator(store, CacheCoordinator::new())
    }

    /// Construct with an injected coordinator (isolated cache instances
    /// for tests, or a cache shared across clients).
    pub fn with_coordinator(store: S, coordinator: Arc<CacheCoordinator>) -> Self {
        Self {
            store: Arc::new(store),
            coordinator,
            listeners: Arc::new(ListenerRegistry::new()),
            signals: Arc::new(SignalHub::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    /// Ambient signal hub. The host application emits focus/reconnect
    /// events here.
    pub fn signals(&self) -> &Arc<SignalHub> {
        &self.signals
    }

    /// Open a collection handle.
    ///
    /// `path = None` means "do not fetch yet": the returned handle is
    /// inert (`data() == None`, `error() == None`) and never touches the
    /// network. Otherwise the initial revalidation (fetch or subscribe,
    /// per `options.listen`) completes before this returns.
    pub async fn collection(
        &self,
        path: Option<&str>,
        options: QueryOptions,
    ) -> Result<Collection<S>, SyncError> {
        self.collection_with_config(path, options, CacheConfig::default())
            .await
    }

    /// Open a collection handle with explicit ambient-revalidation
    /// configuration (polling, focus, reconnect, dedup window).
    pub async fn collection_with_config(
        &self,
        path: Option<&str>,
        options: QueryOptions,
        config: CacheConfig,
    ) -> Result<Collection<S>, SyncError> {
        let Some(path) = path else {
            return Ok(Collection {
                shared: None,
                trigger_task: None,
            });
        };

        let descriptor = options.to_descriptor();
        let key = canonical_key(path, &descriptor)?;

        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            listeners: Arc::clone(&self.listeners),
            path: path.to_string(),
            key,
            query: descriptor,
            listen: AtomicBool::new(options.listen),
            behavior: RwLock::new(ReadBehavior {
                parse_dates: options.parse_dates.clone(),
                keep_snapshots: options.keep_snapshots,
            }),
            config,
            own_listener: Mutex::new(None),
        });

        // Mount-time revalidation, before any trigger can fire.
        shared.revalidate(true).await;

        // Both subscriptions are taken here, not inside the task, so no
        // event emitted after this call returns can be missed.
        let trigger_task = spawn_trigger_task(
            Arc::clone(&shared),
            self.coordinator.cache().subscribe(),
            self.signals.subscribe(),
        );

        Ok(Collection {
            shared: Some(shared),
            trigger_task: Some(trigger_task),
        })
    }

    /// Read one document through the cache.
    pub async fn document(&self, path: &str) -> Result<Document, SyncError> {
        if let Some(doc) = self.coordinator.document(path) {
            return Ok((*doc).clone());
        }
        let raw = self.store.get_document(path).await?;
        let doc = Document::from_raw(raw, &ReadBehavior::default());
        self.coordinator.write_document(doc.clone());
        Ok(doc)
    }

    /// Write one document and invalidate every collection entry registered
    /// for its parent path, so all consumers that might contain it
    /// revalidate.
    pub async fn mutate_document(
        &self,
        path: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<(), SyncError> {
        let (parent, id) = split_document_path(path)
            .ok_or_else(|| SyncError::InvalidPath(path.to_string()))?;

        self.store
            .commit(vec![WriteOp::Set {
                path: path.to_string(),
                fields: fields.clone(),
            }])
            .await?;

        let doc = Document::from_raw(
            RawDocument {
                id: id.to_string(),
                parent: parent.to_string(),
                exists: true,
                has_pending_writes: false,
                fields,
            },
            &ReadBehavior::default(),
        );
        self.coordinator.write_document(doc);
        self.coordinator.invalidate_path(parent);
        Ok(())
    }
}

/// State shared between a handle, its revalidation runs, and its trigger
/// task.
struct Shared<S: DocumentStore> {
    store: Arc<S>,
    coordinator: Arc<CacheCoordinator>,
    listeners: Arc<ListenerRegistry>,
    path: String,
    key: String,
    query: StructuredQuery,
    /// Live/poll mode. Mutable without affecting cache identity.
    listen: AtomicBool,
    /// Parse/snapshot behavior. Mutable without affecting cache identity.
    behavior: RwLock<ReadBehavior>,
    /// Ambient revalidation knobs for poll mode.
    config: CacheConfig,
    /// The listener this handle started, if any.
    own_listener: Mutex<Option<ListenerHandle>>,
}

impl<S: DocumentStore> Shared<S> {
    fn is_listening(&self) -> bool {
        self.listen.load(Ordering::SeqCst)
    }

    /// Configuration in effect right now: live mode disables every
    /// ambient trigger.
    fn effective_config(&self) -> CacheConfig {
        if self.is_listening() {
            CacheConfig::for_listen_mode()
        } else {
            self.config.clone()
        }
    }

    /// Run one revalidation for this key.
    ///
    /// Concurrent runs for the same key collapse onto a single in-flight
    /// operation; ambient (non-forced) runs are additionally dropped
    /// inside the dedup window. Errors land in the entry's error slot; the
    /// previous value stays visible.
    async fn revalidate(&self, force: bool) {
        let cache = self.coordinator.cache();

        if !force
            && cache.within_dedup_window(&self.key, self.effective_config().dedup_window)
        {
            trace!(key = %self.key, "revalidation dropped inside dedup window");
            return;
        }

        match self.coordinator.claim_inflight(&self.key) {
            InflightClaim::Joined(done_rx) => {
                trace!(key = %self.key, "joining in-flight revalidation");
                await_inflight(done_rx).await;
            }
            InflightClaim::Owner(_guard) => {
                cache.begin_validation(&self.key);
                let behavior = self.behavior.read().await.clone();

                let result = if self.is_listening() {
                    match self
                        .listeners
                        .subscribe(
                            self.store.as_ref(),
                            &self.coordinator,
                            &self.path,
                            &self.key,
                            &self.query,
                            behavior,
                        )
                        .await
                    {
                        Ok((documents, handle)) => {
                            *self.own_listener.lock().await = Some(handle);
                            Ok(documents)
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    fetch_collection(
                        self.store.as_ref(),
                        &self.coordinator,
                        &self.path,
                        &self.query,
                        &behavior,
                    )
                    .await
                };

                match result {
                    Ok(documents) => {
                        self.coordinator.write_collection(&self.key, documents, true);
                        self.coordinator.register_query(&self.path, &self.key);
                    }
                    Err(e) => {
                        debug!(key = %self.key, error = %e, "revalidation failed");
                        cache.set_error(&self.key, e);
                    }
                }
            }
        }
    }
}

/// Wait for the next poll tick, or forever when polling is disabled.
async fn poll_tick(poll: &mut Option<tokio::time::Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Background task reacting to invalidations, ambient signals, and the
/// poll interval. Mode flips and explicit revalidations run inline on the
/// handle instead, so a flip fires exactly one revalidation.
fn spawn_trigger_task<S: DocumentStore>(
    shared: Arc<Shared<S>>,
    mut events: broadcast::Receiver<CacheEvent>,
    mut signals: broadcast::Receiver<Signal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut poll = shared
            .config
            .poll_interval
            .map(|d| tokio::time::interval_at(tokio::time::Instant::now() + d, d));

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if event.key == shared.key && event.kind == EventKind::Invalidated {
                            shared.revalidate(true).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(key = %shared.key, missed, "cache event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                signal = signals.recv() => match signal {
                    Ok(signal) => {
                        if signal.triggers(&shared.effective_config()) {
                            debug!(key = %shared.key, ?signal, "ambient revalidation");
                            shared.revalidate(false).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = poll_tick(&mut poll) => {
                    // Ticks keep arriving while live; the subscription
                    // already guarantees freshness, so they are ignored.
                    if !shared.is_listening() {
                        shared.revalidate(false).await;
                    }
                }
            }
        }
        trace!(key = %shared.key, "trigger task ended");
    })
}

/// Handle to one cached collection view.
///
/// Reads (`data`, `error`, `is_validating`) observe the shared cache entry
/// for this handle's canonical key, so independently created handles for
/// the same query always agree.
pub struct Collection<S: DocumentStore> {
    /// `None` for a deferred (`path = None`) handle.
    shared: Option<Arc<Shared<S>>>,
    trigger_task: Option<JoinHandle<()>>,
}

impl<S: DocumentStore> Collection<S> {
    fn shared(&self) -> Result<&Arc<Shared<S>>, SyncError> {
        self.shared.as_ref().ok_or(SyncError::NoPath)
    }

    /// Current result set, if any fetch or push has resolved.
    pub fn data(&self) -> Option<Arc<Vec<Document>>> {
        let shared = self.shared.as_ref()?;
        shared.coordinator.collection(&shared.key)
    }

    /// Last revalidation error, if any. Stale data may still be visible
    /// alongside it.
    pub fn error(&self) -> Option<Arc<SyncError>> {
        let shared = self.shared.as_ref()?;
        shared.coordinator.cache().get(&shared.key)?.error
    }

    /// Whether a fetch or subscription start is in flight for this key.
    pub fn is_validating(&self) -> bool {
        self.shared
            .as_ref()
            .and_then(|s| s.coordinator.cache().get(&s.key))
            .map(|entry| entry.is_validating)
            .unwrap_or(false)
    }

    /// `data() == None && error() == None`: nothing resolved yet.
    pub fn is_loading(&self) -> bool {
        self.data().is_none() && self.error().is_none()
    }

    pub fn is_listening(&self) -> bool {
        self.shared
            .as_ref()
            .map(|s| s.is_listening())
            .unwrap_or(false)
    }

    /// Canonical cache key, if this handle has a path.
    pub fn cache_key(&self) -> Option<&str> {
        self.shared.as_ref().map(|s| s.key.as_str())
    }

    /// Explicitly revalidate now. No-op on a deferred handle.
    pub async fn revalidate(&self) {
        if let Some(shared) = &self.shared {
            shared.revalidate(true).await;
        }
    }

    /// Replace the cached result set locally, without revalidating.
    ///
    /// The new value fans out to per-document entries like any other
    /// collection write.
    pub fn mutate<F>(&self, f: F) -> Result<(), SyncError>
    where
        F: FnOnce(Option<Arc<Vec<Document>>>) -> Vec<Document>,
    {
        let shared = self.shared()?;
        let next = f(shared.coordinator.collection(&shared.key));
        shared.coordinator.write_collection(&shared.key, next, true);
        Ok(())
    }

    /// Switch between live and poll mode.
    ///
    /// A flip fires exactly one revalidation; setting the current mode
    /// again does nothing. Never fires on handle construction.
    pub async fn set_listen(&self, listen: bool) {
        let Some(shared) = &self.shared else { return };

        let previous = shared.listen.swap(listen, Ordering::SeqCst);
        if previous == listen {
            return;
        }

        if !listen {
            // Dropping out of live mode tears the subscription down before
            // the one-shot fetch takes over.
            shared.listeners.unsubscribe(&shared.key);
            shared.own_listener.lock().await.take();
        }

        debug!(key = %shared.key, listen, "mode flipped");
        shared.revalidate(true).await;
    }

    /// Change the date-parsing configuration. Fires exactly one
    /// revalidation when the value actually changes; cache identity is
    /// unaffected.
    pub async fn set_parse_dates(&self, parse_dates: Vec<String>) {
        let Some(shared) = &self.shared else { return };
        {
            let mut behavior = shared.behavior.write().await;
            if behavior.parse_dates == parse_dates {
                return;
            }
            behavior.parse_dates = parse_dates;
        }
        shared.revalidate(true).await;
    }

    /// Change snapshot retention. Fires exactly one revalidation when the
    /// value actually changes; cache identity is unaffected.
    pub async fn set_keep_snapshots(&self, keep_snapshots: bool) {
        let Some(shared) = &self.shared else { return };
        {
            let mut behavior = shared.behavior.write().await;
            if behavior.keep_snapshots == keep_snapshots {
                return;
            }
            behavior.keep_snapshots = keep_snapshots;
        }
        shared.revalidate(true).await;
    }

    /// Read one document of this collection through the cache.
    ///
    /// A document already fanned out by a fetch or push is served without
    /// a round trip; otherwise it is read from the store and written
    /// through.
    pub async fn document(&self, id: &str) -> Result<Document, SyncError> {
        let shared = self.shared()?;
        let path = format!("{}/{}", shared.path, id);
        if let Some(doc) = shared.coordinator.document(&path) {
            return Ok((*doc).clone());
        }
        let raw = shared.store.get_document(&path).await?;
        let behavior = shared.behavior.read().await.clone();
        let doc = Document::from_raw(raw, &behavior);
        shared.coordinator.write_document(doc.clone());
        Ok(doc)
    }

    /// Tear down the live listener for this key, if one is active.
    ///
    /// Dropping the handle does this automatically; the explicit form
    /// exists for callers that want to stop push delivery early.
    pub fn unsubscribe(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.listeners.unsubscribe(&shared.key),
            None => false,
        }
    }

    /// Wait for the next cache change (update or invalidation) of this
    /// handle's key. Never resolves on a deferred handle.
    pub async fn changed(&self) {
        let Some(shared) = &self.shared else {
            return std::future::pending().await;
        };
        let mut events = shared.coordinator.cache().subscribe();
        loop {
            match events.recv().await {
                Ok(event) if event.key == shared.key => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Optimistically add one document (or an ordered list) to the
    /// collection.
    ///
    /// Ids are generated up front with the store's own algorithm, so the
    /// optimistic records and the confirmed remote writes agree. Outside
    /// live mode the new records are appended to the cached result set
    /// (tagged as pending writes) before the remote write is issued; in
    /// live mode the push delivery of the committed documents is
    /// authoritative and no local append happens.
    ///
    /// Resolves with the generated id(s), matching the input cardinality.
    /// On failure the optimistic append is NOT rolled back; the error
    /// carries the pre-assigned ids so a caller can compensate by
    /// identity.
    pub async fn add(&self, payload: impl Into<AddPayload>) -> Result<AddResult, SyncError> {
        match payload.into() {
            AddPayload::One(fields) => {
                let mut ids = self.add_documents(vec![fields]).await?;
                Ok(AddResult::One(ids.remove(0)))
            }
            AddPayload::Many(items) => Ok(AddResult::Many(self.add_documents(items).await?)),
        }
    }

    async fn add_documents(
        &self,
        items: Vec<serde_json::Map<String, Value>>,
    ) -> Result<Vec<String>, SyncError> {
        let shared = self.shared()?;

        let ids: Vec<String> = items
            .iter()
            .map(|_| shared.store.generate_id(&shared.path))
            .collect();

        if !shared.is_listening() {
            let behavior = shared.behavior.read().await.clone();
            let appended: Vec<Document> = ids
                .iter()
                .zip(&items)
                .map(|(id, fields)| {
                    Document::from_raw(
                        RawDocument {
                            id: id.clone(),
                            parent: shared.path.clone(),
                            exists: true,
                            has_pending_writes: true,
                            fields: fields.clone(),
                        },
                        &behavior,
                    )
                })
                .collect();

            let mut next = shared
                .coordinator
                .collection(&shared.key)
                .map(|docs| (*docs).clone())
                .unwrap_or_default();
            next.extend(appended);
            // Local append is already authoritative: no revalidation.
            shared.coordinator.write_collection(&shared.key, next, true);
        }

        let writes: Vec<WriteOp> = ids
            .iter()
            .zip(items)
            .map(|(id, fields)| WriteOp::Set {
                path: format!("{}/{}", shared.path, id),
                fields,
            })
            .collect();

        shared
            .store
            .commit(writes)
            .await
            .map_err(|source| SyncError::BatchWrite {
                ids: ids.clone(),
                source,
            })?;

        Ok(ids)
    }
}

impl<S: DocumentStore> Drop for Collection<S> {
    fn drop(&mut self) {
        if let Some(task) = self.trigger_task.take() {
            task.abort();
        }
        if let Some(shared) = &self.shared
            && let Ok(mut own) = shared.own_listener.try_lock()
            && let Some(handle) = own.take()
        {
            handle.unsubscribe();
        }
    }
}
