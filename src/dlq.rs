//! Dead-letter stream for entries whose handler failed.
//!
//! The consumer loop acknowledges every entry, including failed ones, so a
//! poisoned entry never blocks its stream. Before acking a failure the loop
//! records it here with the original stream, id, raw fields and error text,
//! which keeps it available for manual investigation or replay.
//!
//! # Example
//!
//! ```rust,ignore
//! use chatstream::dlq::DeadLetters;
//!
//! let dead_letters = DeadLetters::new(store.clone());
//! dead_letters.record("chat:messages:votes", &entry, "message 'm1' not found").await?;
//!
//! let failed = dead_letters.count().await?;
//! ```

use crate::store::{EntryId, StoreError, StreamEntry, StreamStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Stream holding dead-lettered entries
pub const DLQ_STREAM_NAME: &str = "chat:deadletter";

/// Kind tag of dead-letter entries
pub const DLQ_KIND: &str = "dead-letter";

/// Maximum entries to keep in the dead-letter stream (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10000;

/// A failed entry stored in the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    /// Stream the entry was read from
    pub stream: String,

    /// Original stream entry id
    pub original_id: EntryId,

    /// Raw fields exactly as read
    pub fields: Vec<(String, String)>,

    /// Error message from the handler
    pub error: String,

    /// RFC 3339 timestamp when the entry was dead-lettered
    pub failed_at: String,
}

impl FailedEntry {
    /// Decode a record read back from the dead-letter stream.
    pub fn from_entry(entry: &StreamEntry) -> Result<Option<Self>, DlqError> {
        if entry.kind() != Some(DLQ_KIND) {
            return Ok(None);
        }
        match entry.payload() {
            Some(body) => Ok(Some(serde_json::from_str(body)?)),
            None => Ok(None),
        }
    }
}

/// Writer for the dead-letter stream.
#[derive(Clone)]
pub struct DeadLetters {
    store: Arc<dyn StreamStore>,
}

impl DeadLetters {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }

    /// Record a failed entry read from `stream`.
    pub async fn record(
        &self,
        stream: &str,
        entry: &StreamEntry,
        error: &str,
    ) -> Result<EntryId, DlqError> {
        let failed = FailedEntry {
            stream: stream.to_string(),
            original_id: entry.id.clone(),
            fields: entry.fields.clone(),
            error: error.to_string(),
            failed_at: chrono::Utc::now().to_rfc3339(),
        };

        let body = serde_json::to_string(&failed).map_err(|e| {
            error!(error = %e, "Failed to serialize entry for dead-letter stream");
            DlqError::Serialization(e)
        })?;

        let id = self
            .store
            .append(DLQ_STREAM_NAME, DLQ_MAX_LEN, &[(DLQ_KIND.to_string(), body)])
            .await?;

        info!(
            dlq_id = %id,
            original_id = %entry.id,
            stream = %stream,
            "Entry moved to dead-letter stream"
        );

        Ok(id)
    }

    /// Number of entries currently in the dead-letter stream.
    pub async fn count(&self) -> Result<u64, DlqError> {
        Ok(self.store.stream_len(DLQ_STREAM_NAME).await?)
    }
}

/// Errors that can occur when working with the dead-letter stream.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
