//! HTTP client for an Elasticsearch-compatible search service.
//!
//! # Example
//!
//! ```rust,ignore
//! use chatstream::search::HttpSearchIndex;
//! use std::time::Duration;
//!
//! let index = HttpSearchIndex::new("http://localhost:9200", "chat-rooms-v1", "chat-rooms")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2);
//! ```

use super::{SearchError, SearchIndex};
use crate::repository::Room;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for search requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 1;

const NDJSON: &str = "application/x-ndjson";
const JSON: &str = "application/json";

/// Mappings for the room index.
fn index_mappings() -> Value {
    json!({
        "mappings": {
            "properties": {
                "name": { "type": "text" },
                "topic": { "type": "text" }
            }
        }
    })
}

/// NDJSON bulk body indexing each room under its id.
fn bulk_index_body(alias: &str, rooms: &[Room]) -> Result<String, SearchError> {
    let mut body = String::new();
    for room in rooms {
        body.push_str(&serde_json::to_string(&json!({
            "index": { "_index": alias, "_id": room.id }
        }))?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&json!({
            "name": room.name,
            "topic": room.topic,
        }))?);
        body.push('\n');
    }
    Ok(body)
}

/// NDJSON bulk body deleting each room id.
fn bulk_delete_body(alias: &str, room_ids: &[String]) -> Result<String, SearchError> {
    let mut body = String::new();
    for id in room_ids {
        body.push_str(&serde_json::to_string(&json!({
            "delete": { "_index": alias, "_id": id }
        }))?);
        body.push('\n');
    }
    Ok(body)
}

/// Reasons of the rejected items in a bulk reply that reported `errors: true`.
///
/// Deleting a document that is already gone is not a failure.
fn bulk_failures(reply: &Value) -> Vec<String> {
    let Some(items) = reply["items"].as_array() else {
        return vec!["bulk reply reported errors without items".to_string()];
    };

    items
        .iter()
        .filter_map(|item| {
            let (action, result) = item.as_object()?.iter().next()?;
            let error = result.get("error")?;
            if action == "delete" && (result["status"] == 404 || result["result"] == "not_found") {
                return None;
            }
            Some(
                error["reason"]
                    .as_str()
                    .or_else(|| error["type"].as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            )
        })
        .collect()
}

/// Search index reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSearchIndex {
    /// Base URL of the search service
    base_url: String,

    /// Concrete index created on bootstrap
    index: String,

    /// Alias documents are written through
    alias: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    timeout: Duration,

    /// Number of retries on 5xx errors
    retries: u32,
}

impl HttpSearchIndex {
    pub fn new(base_url: impl Into<String>, index: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index: index.into(),
            alias: alias.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of retries on 5xx errors
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request, retrying transport failures and 5xx responses.
    ///
    /// Any non-5xx response is returned as `(status, body)`.
    async fn send(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: String,
    ) -> Result<(StatusCode, String), SearchError> {
        let url = self.url(path);
        let mut last_error = None;
        let mut attempts = 0;

        while attempts <= self.retries {
            if attempts > 0 {
                debug!(attempt = attempts, max_retries = self.retries, url = %url, "Retrying search request");
            }

            let result = self
                .client
                .request(method.clone(), &url)
                .timeout(self.timeout)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    let text = match response.text().await {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, url = %url, attempt = attempts, "Failed to read search response");
                            last_error = Some(SearchError::Http(e));
                            attempts += 1;
                            continue;
                        }
                    };

                    if !status.is_server_error() {
                        return Ok((status, text));
                    }

                    warn!(status = %status, url = %url, attempt = attempts, "Search service returned server error");
                    last_error = Some(SearchError::Status {
                        status: status.as_u16(),
                        body: text,
                    });
                }
                Err(e) => {
                    warn!(error = %e, url = %url, attempt = attempts, "Search request failed");
                    last_error = Some(SearchError::Http(e));
                }
            }

            attempts += 1;
        }

        Err(last_error.unwrap_or(SearchError::Status {
            status: 0,
            body: "no attempt made".to_string(),
        }))
    }

    async fn bulk(&self, body: String) -> Result<(), SearchError> {
        let (status, text) = self.send(Method::POST, "_bulk", NDJSON, body).await?;
        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let reply: Value = serde_json::from_str(&text)?;
        if !reply["errors"].as_bool().unwrap_or(false) {
            return Ok(());
        }

        let failures = bulk_failures(&reply);
        let Some(first_reason) = failures.first() else {
            debug!(alias = %self.alias, "Bulk deletes hit documents already gone");
            return Ok(());
        };
        warn!(
            alias = %self.alias,
            failed = failures.len(),
            first_reason = %first_reason,
            "Bulk request completed with item errors"
        );
        Err(SearchError::Bulk {
            failed: failures.len(),
            first_reason: first_reason.clone(),
        })
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn bootstrap(&self) -> Result<(), SearchError> {
        let mappings = serde_json::to_string(&index_mappings())?;
        let (status, text) = self.send(Method::PUT, &self.index, JSON, mappings).await?;

        if status.is_success() {
            info!(index = %self.index, "Search index created");
        } else if text.contains("resource_already_exists_exception") {
            debug!(index = %self.index, "Search index already exists");
        } else {
            return Err(SearchError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let actions = serde_json::to_string(&json!({
            "actions": [{ "add": { "index": self.index, "alias": self.alias } }]
        }))?;
        let (status, text) = self.send(Method::POST, "_aliases", JSON, actions).await?;
        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        info!(index = %self.index, alias = %self.alias, "Search alias ready");
        Ok(())
    }

    async fn index_rooms(&self, rooms: &[Room]) -> Result<(), SearchError> {
        if rooms.is_empty() {
            return Ok(());
        }
        self.bulk(bulk_index_body(&self.alias, rooms)?).await?;
        debug!(alias = %self.alias, count = rooms.len(), "Rooms indexed");
        Ok(())
    }

    async fn remove_rooms(&self, room_ids: &[String]) -> Result<(), SearchError> {
        if room_ids.is_empty() {
            return Ok(());
        }
        self.bulk(bulk_delete_body(&self.alias, room_ids)?).await?;
        debug!(alias = %self.alias, count = room_ids.len(), "Rooms removed from index");
        Ok(())
    }
}
