//! Backing-store contract for streams and keyed leases.
//!
//! Two traits describe everything the backbone needs from the shared store:
//!
//! - [`StreamStore`]: capped append, consumer-group reads, acknowledgement and
//!   group administration.
//! - [`KeyValueStore`]: conditional "set if absent with TTL" and atomic
//!   "delete iff value matches", the primitives behind [`crate::lock`].
//!
//! [`RedisStore`] implements both over a pooled Redis connection.
//! [`MemoryStore`] implements the same semantics in-process so every component
//! can be exercised against an isolated store.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Stream entry id assigned by the store (e.g. `"1700000000000-0"`).
pub type EntryId = String;

/// Errors surfaced by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not obtain a connection
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command
    #[error("store command error: {0}")]
    Command(String),

    /// A consumer group with this name is already registered on the stream
    #[error("consumer group '{group}' already exists on stream '{stream}'")]
    GroupExists { stream: String, group: String },

    /// The consumer group (or its stream) does not exist
    #[error("no consumer group '{group}' on stream '{stream}'")]
    NoGroup { stream: String, group: String },
}

/// Where a newly created or reset consumer group cursor points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver every entry still retained in the stream
    Beginning,
    /// Deliver only entries appended from now on
    Newest,
}

impl StartPosition {
    /// The Redis id literal for this position.
    pub fn as_redis_id(&self) -> &'static str {
        match self {
            StartPosition::Beginning => "0",
            StartPosition::Newest => "$",
        }
    }
}

/// One entry read from a stream.
///
/// `fields[0]` carries the kind tag and its JSON body; the body may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Kind tag of the entry, if any field is present.
    pub fn kind(&self) -> Option<&str> {
        self.fields.first().map(|(kind, _)| kind.as_str())
    }

    /// Raw JSON body of the entry, if present and non-empty.
    pub fn payload(&self) -> Option<&str> {
        self.fields
            .first()
            .map(|(_, payload)| payload.as_str())
            .filter(|payload| !payload.is_empty())
    }
}

/// Append-only streams with consumer groups.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append one entry, trimming the stream to roughly `max_len` entries.
    async fn append(
        &self,
        stream: &str,
        max_len: usize,
        fields: &[(String, String)],
    ) -> Result<EntryId, StoreError>;

    /// Read up to `count` entries newer than the group's cursor, blocking for
    /// at most `block` when none are available. Returned entries become
    /// pending for `consumer` until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Take over up to `count` entries that have been pending for at least
    /// `min_idle`, whichever consumer they were delivered to. Claimed entries
    /// become pending for `consumer` with a fresh delivery time. Pending
    /// entries already trimmed from the stream are dropped, not returned.
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledge an entry. Returns `false` when it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError>;

    /// Create a consumer group. Fails with [`StoreError::GroupExists`] when
    /// the group is already registered.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        make_stream: bool,
    ) -> Result<(), StoreError>;

    /// Move an existing group's cursor. Fails with [`StoreError::NoGroup`]
    /// when the group is absent.
    async fn set_group_cursor(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), StoreError>;

    /// Number of delivered but unacknowledged entries for the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StoreError>;

    /// Number of entries currently retained in the stream.
    async fn stream_len(&self, stream: &str) -> Result<u64, StoreError>;
}

/// Keyed values with expiry, used for leases.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key = value` with expiry only if `key` is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_accessors() {
        let entry = StreamEntry::new(
            "1-0",
            vec![("job".to_string(), r#"{"type":"search-resync"}"#.to_string())],
        );
        assert_eq!(entry.kind(), Some("job"));
        assert_eq!(entry.payload(), Some(r#"{"type":"search-resync"}"#));
    }

    #[test]
    fn test_entry_empty_payload() {
        let entry = StreamEntry::new("1-0", vec![("job".to_string(), String::new())]);
        assert_eq!(entry.kind(), Some("job"));
        assert!(entry.payload().is_none());

        let bare = StreamEntry::new("1-1", Vec::new());
        assert!(bare.kind().is_none());
    }

    #[test]
    fn test_start_position_ids() {
        assert_eq!(StartPosition::Beginning.as_redis_id(), "0");
        assert_eq!(StartPosition::Newest.as_redis_id(), "$");
    }
}
