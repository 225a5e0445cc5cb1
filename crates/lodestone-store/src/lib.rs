//! Document store drivers for the lodestone sync engine.
//!
//! This crate defines the contract the engine requires from a backing store
//! and ships two drivers for it:
//!
//! - **HttpStore**: JSON-over-HTTP driver with a WebSocket listen channel
//! - **MemoryStore**: in-process backend with full query evaluation, used
//!   as the test backend across the workspace
//!
//! Document ids are generated client-side so optimistic cache inserts and
//! confirmed remote writes agree on identity.

mod error;
mod http;
mod id;
pub mod memory;
mod store;
mod types;

pub use error::StoreError;
pub use http::HttpStore;
pub use id::generate_document_id;
pub use memory::MemoryStore;
pub use store::{CancelHandle, DocumentStore, ListenOptions, SnapshotEvent, Subscription};
pub use types::{
    Direction, FieldFilter, FilterOp, OrderBy, RawDocument, StructuredQuery, WriteOp,
    split_document_path,
};
