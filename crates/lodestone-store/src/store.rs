//! The `DocumentStore` trait and subscription plumbing.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::error::StoreError;
use crate::types::{RawDocument, StructuredQuery, WriteOp};

/// Options for a live query subscription.
#[derive(Debug, Clone, Copy)]
pub struct ListenOptions {
    /// Deliver snapshots for metadata-only changes (e.g. a pending-write
    /// flag flipping), not just field data changes.
    pub include_metadata_changes: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            include_metadata_changes: true,
        }
    }
}

/// An event delivered on a live subscription.
#[derive(Debug)]
pub enum SnapshotEvent {
    /// A full result set for the subscribed query.
    Snapshot(Vec<RawDocument>),
    /// The subscription failed. No further events follow.
    Error(StoreError),
}

/// A live subscription to query results.
///
/// Events arrive on `events`; dropping or cancelling `cancel` stops the feed.
pub struct Subscription {
    pub events: mpsc::Receiver<SnapshotEvent>,
    pub cancel: CancelHandle,
}

/// Cancellation handle for a live subscription.
///
/// Cancelling is idempotent: calling it twice, or after the backing task is
/// already gone, is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Create a cancel handle and the receiver a driver task should watch.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Stop the subscription. Safe to call any number of times.
    pub fn cancel(&self) {
        // send_replace never fails, even with no live receivers
        let was = self.tx.send_replace(true);
        if !was {
            trace!("subscription cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Contract every store driver implements.
///
/// The sync engine only ever needs these five operations: one-shot query
/// execution, single-document reads, live subscriptions, client-side id
/// generation, and atomic batch writes.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Execute a query once and return the matching documents in order.
    async fn run_query(
        &self,
        path: &str,
        query: &StructuredQuery,
    ) -> Result<Vec<RawDocument>, StoreError>;

    /// Read a single document by its full path.
    async fn get_document(&self, path: &str) -> Result<RawDocument, StoreError>;

    /// Open a live subscription for a query.
    ///
    /// The first event is always a full snapshot of the current result set.
    async fn listen(
        &self,
        path: &str,
        query: &StructuredQuery,
        options: ListenOptions,
    ) -> Result<Subscription, StoreError>;

    /// Generate a document id for the given collection path.
    ///
    /// Must be safe to pre-assign client-side: committing a `WriteOp::Set`
    /// with this id yields a document whose remote id matches.
    fn generate_id(&self, collection_path: &str) -> String;

    /// Apply a batch of writes atomically: either all succeed or none do.
    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StoreError>;
}
