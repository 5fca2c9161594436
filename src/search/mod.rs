//! Full-text search index triggers.
//!
//! The index itself is an external service. The backbone only needs to
//! bootstrap it once ([`SearchIndex::bootstrap`]) and push room documents into
//! it ([`SearchIndex::index_rooms`], [`SearchIndex::remove_rooms`]).

pub mod http;

use crate::repository::Room;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub use self::http::HttpSearchIndex;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The bulk request went through but some of its items were rejected
    #[error("{failed} bulk item(s) failed, first: {first_reason}")]
    Bulk { failed: usize, first_reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index and point the alias at it. Safe to repeat.
    async fn bootstrap(&self) -> Result<(), SearchError>;

    /// Insert or replace the documents for `rooms`.
    async fn index_rooms(&self, rooms: &[Room]) -> Result<(), SearchError>;

    /// Drop the documents for rooms that no longer exist.
    async fn remove_rooms(&self, room_ids: &[String]) -> Result<(), SearchError>;
}

/// Calls recorded by [`MemorySearchIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCall {
    Bootstrap,
    Index(Vec<String>),
    Remove(Vec<String>),
}

/// Search index that records calls instead of talking to a service.
#[derive(Clone, Default)]
pub struct MemorySearchIndex {
    calls: Arc<Mutex<Vec<SearchCall>>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<SearchCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn bootstrap(&self) -> Result<(), SearchError> {
        self.calls.lock().await.push(SearchCall::Bootstrap);
        Ok(())
    }

    async fn index_rooms(&self, rooms: &[Room]) -> Result<(), SearchError> {
        let ids = rooms.iter().map(|room| room.id.clone()).collect();
        self.calls.lock().await.push(SearchCall::Index(ids));
        Ok(())
    }

    async fn remove_rooms(&self, room_ids: &[String]) -> Result<(), SearchError> {
        self.calls
            .lock()
            .await
            .push(SearchCall::Remove(room_ids.to_vec()));
        Ok(())
    }
}
