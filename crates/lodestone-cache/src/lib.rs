//! Generic keyed request cache.
//!
//! A process-wide map from string keys to cached request results, with the
//! change-notification and revalidation plumbing a synchronization layer
//! needs on top of it:
//!
//! - **Entries** hold the last value, the last error, and validation state
//! - **Events** broadcast every write and invalidation, keyed
//! - **Config** carries the ambient revalidation knobs (poll interval,
//!   focus, reconnect, dedup window)
//! - **Signals** deliver ambient focus/reconnect notifications from the
//!   host application
//!
//! The cache stores whatever value and error types the consumer chooses; it
//! never interprets them.

mod cache;
mod config;
mod signal;

pub use cache::{CacheEvent, Entry, EventKind, RequestCache};
pub use config::CacheConfig;
pub use signal::{Signal, SignalHub};
