//! Error types for document store drivers.

use thiserror::Error;

/// Errors that can occur when talking to a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store rejected the request.
    #[error("store error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Document not found.
    #[error("document not found: {path}")]
    NotFound { path: String },

    /// A document or collection path was malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// WebSocket error on the listen channel.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The listen channel ended without being cancelled.
    #[error("listen channel closed by server")]
    ListenClosed,
}
