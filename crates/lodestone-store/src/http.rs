//! HTTP document store driver.
//!
//! Talks JSON to a remote store over three endpoints (`/v1/query`,
//! `/v1/commit`, `/v1/doc/{path}`) and opens live subscriptions over a
//! WebSocket listen channel. Transport errors are surfaced verbatim; this
//! driver never retries on behalf of the engine.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::id::generate_document_id;
use crate::store::{CancelHandle, DocumentStore, ListenOptions, SnapshotEvent, Subscription};
use crate::types::{RawDocument, StructuredQuery, WriteOp};

/// Buffered snapshots per subscription.
const SUBSCRIPTION_BUFFER: usize = 64;

/// HTTP driver for a remote document store.
pub struct HttpStore {
    http: Client,
    base_url: String,
    ws_url: String,
    auth_token: Option<String>,
}

impl HttpStore {
    /// Create a new driver for the given base URL.
    ///
    /// The WebSocket listen endpoint is derived from the base URL
    /// (`http` → `ws`, `https` → `wss`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let ws_url = derive_ws_url(&base_url);

        Self {
            http,
            base_url,
            ws_url,
            auth_token: None,
        }
    }

    /// Attach a bearer token to every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn read_error(response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("failed to read error body: {}", e));
        StoreError::Remote { status, message }
    }
}

fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    path: &'a str,
    query: &'a StructuredQuery,
}

#[derive(Deserialize)]
struct QueryResponse {
    documents: Vec<RawDocument>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitRequest {
    writes: Vec<WriteOp>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListenRequest<'a> {
    path: &'a str,
    query: &'a StructuredQuery,
    include_metadata_changes: bool,
}

/// A frame on the listen channel.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ListenMessage {
    Snapshot { documents: Vec<RawDocument> },
    Error { message: String },
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn run_query(
        &self,
        path: &str,
        query: &StructuredQuery,
    ) -> Result<Vec<RawDocument>, StoreError> {
        let url = format!("{}/v1/query", self.base_url);
        let response = self
            .authorize(self.http.post(&url))
            .json(&QueryRequest { path, query })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let body: QueryResponse = response.json().await?;
        trace!(path = %path, documents = body.documents.len(), "query executed");
        Ok(body.documents)
    }

    async fn get_document(&self, path: &str) -> Result<RawDocument, StoreError> {
        let url = format!("{}/v1/doc/{}", self.base_url, path);
        let response = self.authorize(self.http.get(&url)).send().await?;

        if response.status().as_u16() == 404 {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        Ok(response.json().await?)
    }

    async fn listen(
        &self,
        path: &str,
        query: &StructuredQuery,
        options: ListenOptions,
    ) -> Result<Subscription, StoreError> {
        let url = format!("{}/v1/listen", self.ws_url);

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| StoreError::WebSocket(format!("connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        let request = serde_json::to_string(&ListenRequest {
            path,
            query,
            include_metadata_changes: options.include_metadata_changes,
        })?;
        write
            .send(Message::Text(request.into()))
            .await
            .map_err(|e| StoreError::WebSocket(format!("subscribe failed: {}", e)))?;

        info!(path = %path, "listen channel opened");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (cancel, mut cancel_rx) = CancelHandle::new();
        let task_path = path.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    changed = cancel_rx.changed() => {
                        // A dropped handle counts as cancellation.
                        if changed.is_err() || *cancel_rx.borrow() {
                            debug!(path = %task_path, "listen channel cancelled");
                            return;
                        }
                    }

                    frame = read.next() => {
                        let event = match frame {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ListenMessage>(&text) {
                                    Ok(ListenMessage::Snapshot { documents }) => {
                                        SnapshotEvent::Snapshot(documents)
                                    }
                                    Ok(ListenMessage::Error { message }) => {
                                        SnapshotEvent::Error(StoreError::Remote {
                                            status: 0,
                                            message,
                                        })
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "malformed listen frame, skipping");
                                        continue;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                // tungstenite auto-responds to pings
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                SnapshotEvent::Error(StoreError::ListenClosed)
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => SnapshotEvent::Error(StoreError::WebSocket(
                                format!("read error: {}", e),
                            )),
                        };

                        let terminal = matches!(event, SnapshotEvent::Error(_));
                        if tx.send(event).await.is_err() || terminal {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Subscription { events: rx, cancel })
    }

    fn generate_id(&self, _collection_path: &str) -> String {
        generate_document_id()
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        let url = format!("{}/v1/commit", self.base_url);
        let count = writes.len();
        let response = self
            .authorize(self.http.post(&url))
            .json(&CommitRequest { writes })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        debug!(writes = count, "commit applied");
        Ok(())
    }
}
