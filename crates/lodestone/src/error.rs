//! Error types for the sync engine.

use thiserror::Error;

use lodestone_store::StoreError;

/// Errors surfaced by the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backing store failed. Never retried by the engine; surfaced
    /// verbatim as the cache entry's error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A query descriptor could not be serialized into a canonical key.
    /// Fatal to the revalidation attempt; the existing cache entry is
    /// left untouched.
    #[error("malformed query descriptor: {0}")]
    MalformedQuery(#[source] serde_json::Error),

    /// An atomic batch write failed after ids were already assigned
    /// (and, outside live mode, after the optimistic append). The engine
    /// does not roll the append back; the pre-assigned ids let a caller
    /// compensate by identity.
    #[error("batched write failed for {} document(s): {source}", ids.len())]
    BatchWrite {
        ids: Vec<String>,
        #[source]
        source: StoreError,
    },

    /// Operation requires a collection path, but the handle was created
    /// without one.
    #[error("no collection path: handle was created in deferred mode")]
    NoPath,

    /// A live subscription ended before delivering its first snapshot.
    #[error("subscription closed before the first snapshot")]
    SubscriptionClosed,

    /// A document or collection path was malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}
