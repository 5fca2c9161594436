//! Per-event handlers.
//!
//! Each event kind has exactly one handler. Handlers mutate chat state through
//! the [`ChatRepository`], may publish follow-up entries through the
//! [`Producer`], and must be safe to re-run on the same entry: the consumer
//! loop acknowledges after the handler returns, so a crash in between causes
//! redelivery.
//!
//! ## Handlers
//!
//! - [`remove_user`]: archive and delete an account, notify room peers
//! - [`counters`]: capped unread and reply counters
//! - [`votes`]: poll tally recount and notification
//! - [`search_sync`]: search index bootstrap and room reindexing
//! - [`job`]: background job trampoline
//! - [`fanout`]: hand addressed notifications to the live multiplexer

pub mod counters;
pub mod fanout;
pub mod job;
pub mod remove_user;
pub mod search_sync;
pub mod votes;

use crate::event::EventError;
use crate::lock::LockManager;
use crate::multiplexer::Multiplexer;
use crate::producer::{Producer, ProducerError};
use crate::repository::{ChatRepository, RepositoryError};
use crate::search::{SearchError, SearchIndex};
use crate::store::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Badge counters never go past this value.
pub const COUNTER_CEILING: u32 = 100;

/// Upper bound on room ids handled per search batch.
pub const SEARCH_BATCH_SIZE: usize = 100;

/// Errors that can occur while handling an entry.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The entry could not be decoded
    #[error("undecodable entry: {0}")]
    Decode(#[from] EventError),

    /// A record referenced by the payload does not exist
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("publish error: {0}")]
    Publish(#[from] ProducerError),

    #[error("lock error: {0}")]
    Lock(#[from] StoreError),
}

/// Result of a successful handler run.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    /// Name of the handler that produced this outcome
    pub handler: &'static str,

    /// Human-readable message describing what happened
    pub message: String,

    /// Optional structured details
    pub metadata: Option<serde_json::Value>,
}

impl HandlerOutcome {
    pub fn success(handler: &'static str, message: impl Into<String>) -> Self {
        Self {
            handler,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(
        handler: &'static str,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            handler,
            message: message.into(),
            metadata: Some(metadata),
        }
    }
}

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub repository: Arc<dyn ChatRepository>,
    pub search: Arc<dyn SearchIndex>,
    pub producer: Producer,
    pub locks: LockManager,
    pub multiplexer: Multiplexer,
}
