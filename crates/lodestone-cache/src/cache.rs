//! The keyed request cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast capacity for cache events. Sized for push-update bursts.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The entry's value, error, or validation state changed.
    Updated,
    /// The entry was marked stale and should be revalidated by whoever
    /// owns the key.
    Invalidated,
}

/// A keyed change notification.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub key: String,
    pub kind: EventKind,
}

/// One cached request result.
///
/// `value` and `error` are independent: a failed revalidation records its
/// error while the previous (stale) value stays visible.
#[derive(Debug)]
pub struct Entry<V, E> {
    pub value: Option<V>,
    pub error: Option<Arc<E>>,
    /// False once the entry has been invalidated through another path.
    pub valid: bool,
    /// True while a fetch or subscription start is in flight for this key.
    pub is_validating: bool,
    /// When the last successful validation finished. Drives the dedup window.
    pub last_validated: Option<Instant>,
}

// Manual impl: errors live behind an `Arc`, so cloning an entry never
// requires `E: Clone`.
impl<V: Clone, E> Clone for Entry<V, E> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            error: self.error.clone(),
            valid: self.valid,
            is_validating: self.is_validating,
            last_validated: self.last_validated,
        }
    }
}

impl<V, E> Default for Entry<V, E> {
    fn default() -> Self {
        Self {
            value: None,
            error: None,
            valid: true,
            is_validating: false,
            last_validated: None,
        }
    }
}

/// Process-wide request cache.
///
/// Keys are strings; values and errors are whatever the consumer stores.
/// Reads are concurrent; writes are serialized per key by the underlying
/// shard locks, so unrelated keys never block each other.
pub struct RequestCache<V, E> {
    entries: DashMap<String, Entry<V, E>>,
    events_tx: broadcast::Sender<CacheEvent>,
}

impl<V, E> RequestCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            events_tx,
        })
    }

    /// Subscribe to change events for all keys.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }

    /// Read the current entry for a key.
    pub fn get(&self, key: &str) -> Option<Entry<V, E>> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Read just the current value for a key.
    pub fn get_value(&self, key: &str) -> Option<V> {
        self.entries.get(key).and_then(|e| e.value.clone())
    }

    /// Write a value.
    ///
    /// Clears any previous error, marks the entry valid, and stamps the
    /// validation time. When `revalidate` is set, an `Invalidated` event
    /// follows the `Updated` one so the key's owner re-runs its request;
    /// plain write-through updates pass `false`.
    pub fn set(&self, key: &str, value: V, revalidate: bool) {
        {
            let mut entry = self.entries.entry(key.to_string()).or_default();
            entry.value = Some(value);
            entry.error = None;
            entry.valid = true;
            entry.is_validating = false;
            entry.last_validated = Some(Instant::now());
        }
        self.emit(key, EventKind::Updated);
        if revalidate {
            self.emit(key, EventKind::Invalidated);
        }
    }

    /// Record a failed request. The previous value stays visible.
    pub fn set_error(&self, key: &str, error: E) {
        {
            let mut entry = self.entries.entry(key.to_string()).or_default();
            entry.error = Some(Arc::new(error));
            entry.is_validating = false;
        }
        self.emit(key, EventKind::Updated);
    }

    /// Mark an entry stale without touching its value.
    pub fn invalidate(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.valid = false;
        }
        self.emit(key, EventKind::Invalidated);
    }

    /// Mark a validation as started for the key.
    ///
    /// The flag clears when a result (value or error) is recorded.
    pub fn begin_validation(&self, key: &str) {
        {
            let mut entry = self.entries.entry(key.to_string()).or_default();
            entry.is_validating = true;
        }
        self.emit(key, EventKind::Updated);
    }

    /// Whether a revalidation for this key should be skipped because one
    /// finished within the dedup window.
    pub fn within_dedup_window(&self, key: &str, window: Duration) -> bool {
        if window.is_zero() {
            return false;
        }
        self.entries
            .get(key)
            .and_then(|e| e.last_validated)
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Drop an entry entirely. Eviction policy lives with the caller.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop all entries. Test harness use.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn emit(&self, key: &str, kind: EventKind) {
        let event = CacheEvent {
            key: key.to_string(),
            kind,
        };
        if self.events_tx.send(event).is_err() {
            trace!(key = %key, "no subscribers for cache event");
        }
    }
}
