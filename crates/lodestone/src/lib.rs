//! Client-side cache-coherence and revalidation engine for remote,
//! query-addressable document collections.
//!
//! Lodestone keeps locally cached views consistent with a backing store
//! under two competing update strategies: one-shot polling fetches and
//! push-based live subscriptions. The engine:
//!
//! - derives a stable canonical identity for every query
//! - satisfies each query via a single fetch or a live subscription
//! - propagates updates between collection entries and their constituent
//!   per-document entries, in both directions
//! - collapses concurrent work for the same query identity onto one
//!   in-flight operation
//! - applies optimistic local mutations ahead of remote confirmation
//!
//! ## Example
//!
//! ```rust,no_run
//! use lodestone::{Client, QueryOptions};
//! use lodestone_store::{FilterOp, MemoryStore};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), lodestone::SyncError> {
//! let client = Client::new(MemoryStore::new());
//!
//! let adults = client
//!     .collection(
//!         Some("users"),
//!         QueryOptions::default()
//!             .where_field("age", FilterOp::GreaterThanOrEqual, 21)
//!             .order_by("name")
//!             .limit(2),
//!     )
//!     .await?;
//!
//! for doc in adults.data().iter().flat_map(|docs| docs.iter()) {
//!     println!("{}: {:?}", doc.id, doc.data.get("name"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod coordinator;
pub mod document;
mod error;
mod fetch;
pub mod listener;
pub mod query;

pub use collection::{AddPayload, AddResult, Client, Collection};
pub use coordinator::{CacheCoordinator, CachedValue, InflightClaim, SyncCache, await_inflight};
pub use document::{Document, RESERVED_FIELDS, ReadBehavior};
pub use error::SyncError;
pub use listener::{ListenerHandle, ListenerRegistry};
pub use query::{OrderSpec, QueryOptions, WhereSpec, canonical_key};

// Re-export the collaborator surfaces consumers need alongside the engine.
pub use lodestone_cache::{CacheConfig, CacheEvent, Entry, EventKind, Signal, SignalHub};
pub use lodestone_store::{
    Direction, DocumentStore, FieldFilter, FilterOp, OrderBy, RawDocument, StoreError,
    StructuredQuery, WriteOp,
};
