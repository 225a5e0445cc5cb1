//! Live subscription management.
//!
//! At most one live listener exists per canonical key; subscribing again
//! for the same key tears the previous listener down first. Cancellation
//! is synchronous from the caller's perspective: once `unsubscribe`
//! returns, no further snapshot is written into the cache for that handle,
//! even if one was already in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

use lodestone_store::{DocumentStore, ListenOptions, SnapshotEvent, StructuredQuery};

use crate::coordinator::CacheCoordinator;
use crate::document::{Document, ReadBehavior};
use crate::error::SyncError;

/// Handle for one live subscription.
///
/// Cloneable; all clones share the same liveness gate.
#[derive(Clone)]
pub struct ListenerHandle {
    cancel: lodestone_store::CancelHandle,
    alive: Arc<AtomicBool>,
}

impl ListenerHandle {
    /// Tear the subscription down.
    ///
    /// Idempotent: calling it twice, or after the forwarding task is
    /// already gone, is a no-op. The liveness gate flips before the store
    /// cancellation so no snapshot already in flight can still be written.
    pub fn unsubscribe(&self) {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.cancel.cancel();
        if was_alive {
            trace!("listener torn down");
        }
    }

    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Registry of live listeners, one per canonical key.
pub struct ListenerRegistry {
    active: DashMap<String, ListenerHandle>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
        }
    }

    /// Open a live subscription for a key, resolving with the first
    /// snapshot.
    ///
    /// Any previous listener for the key is cancelled before the new
    /// subscription opens. Snapshots after the first are forwarded into
    /// the coordinator (collection entry plus per-document write-through)
    /// until the handle is torn down; a transport error after the first
    /// snapshot lands in the entry's error slot and ends the feed.
    pub(crate) async fn subscribe<S: DocumentStore>(
        &self,
        store: &S,
        coordinator: &Arc<CacheCoordinator>,
        path: &str,
        key: &str,
        query: &StructuredQuery,
        behavior: ReadBehavior,
    ) -> Result<(Vec<Document>, ListenerHandle), SyncError> {
        if let Some((_, previous)) = self.active.remove(key) {
            debug!(key = %key, "replacing live listener for key");
            previous.unsubscribe();
        }

        let mut subscription = store
            .listen(
                path,
                query,
                ListenOptions {
                    include_metadata_changes: true,
                },
            )
            .await?;

        let first = match subscription.events.recv().await {
            Some(SnapshotEvent::Snapshot(raw)) => raw
                .into_iter()
                .map(|r| Document::from_raw(r, &behavior))
                .collect::<Vec<_>>(),
            Some(SnapshotEvent::Error(e)) => {
                subscription.cancel.cancel();
                return Err(e.into());
            }
            None => return Err(SyncError::SubscriptionClosed),
        };

        let alive = Arc::new(AtomicBool::new(true));
        let handle = ListenerHandle {
            cancel: subscription.cancel.clone(),
            alive: Arc::clone(&alive),
        };

        let task_key = key.to_string();
        let coordinator = Arc::clone(coordinator);
        let mut events = subscription.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    SnapshotEvent::Snapshot(raw) => {
                        let docs: Vec<Document> = raw
                            .into_iter()
                            .map(|r| Document::from_raw(r, &behavior))
                            .collect();
                        // Re-check the gate right before the write: a
                        // teardown that happened while mapping must win.
                        if !alive.load(Ordering::SeqCst) {
                            break;
                        }
                        coordinator.write_collection(&task_key, docs, true);
                    }
                    SnapshotEvent::Error(e) => {
                        if alive.load(Ordering::SeqCst) {
                            coordinator.cache().set_error(&task_key, e.into());
                        }
                        break;
                    }
                }
            }
            trace!(key = %task_key, "listener feed ended");
        });

        self.active.insert(key.to_string(), handle.clone());
        Ok((first, handle))
    }

    /// Tear down the listener for a key, if any.
    pub fn unsubscribe(&self, key: &str) -> bool {
        match self.active.remove(key) {
            Some((_, handle)) => {
                handle.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Whether a live listener is currently active for a key.
    pub fn is_active(&self, key: &str) -> bool {
        self.active
            .get(key)
            .map(|h| h.is_active())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|h| h.is_active()).count()
    }
}
