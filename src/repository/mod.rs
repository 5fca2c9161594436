//! Chat state touched by the event handlers.
//!
//! The document store itself is owned by the wider chat service; this module
//! only describes the operations the backbone needs from it. Every mutating
//! operation is either an atomic per-record update (capped increments) or an
//! upsert, so handlers stay safe to re-run.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use self::memory::MemoryRepository;
pub use self::redis::RedisRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository connection error: {0}")]
    Connection(String),

    #[error("repository command error: {0}")]
    Command(String),

    #[error("corrupt record '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A user's subscription to a room with its badge counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub room_id: String,
    pub user_id: String,
    pub unread: u32,
    pub replies: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// One selectable answer of a poll message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub voters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    #[serde(default)]
    pub answers: Vec<Answer>,
}

/// Aggregate vote counts for a poll message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub message_id: String,
    /// Votes per answer id
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
}

impl VoteTally {
    /// Recompute the tally from the message's current answers.
    pub fn compute(message: &Message) -> Self {
        let counts: BTreeMap<String, u64> = message
            .answers
            .iter()
            .map(|answer| (answer.id.clone(), answer.voters.len() as u64))
            .collect();
        let total = counts.values().sum();

        Self {
            message_id: message.id.clone(),
            counts,
            total,
        }
    }
}

/// Archive of a removed account, keyed by the original user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedUser {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Rooms the user still belonged to at removal time
    pub rooms: Vec<String>,
    pub removed_at: DateTime<Utc>,
}

/// Operations the handlers perform against chat state.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, RepositoryError>;

    /// Ids of the rooms the user is a member of.
    async fn user_room_ids(&self, user_id: &str) -> Result<Vec<String>, RepositoryError>;

    /// Insert or replace the archive record for `removed.id`.
    async fn upsert_removed_user(&self, removed: &RemovedUser) -> Result<(), RepositoryError>;

    async fn find_removed_user(&self, user_id: &str) -> Result<Option<RemovedUser>, RepositoryError>;

    /// Delete every membership of the user. Returns how many were deleted.
    async fn delete_memberships(&self, user_id: &str) -> Result<u64, RepositoryError>;

    /// Delete the user record. Returns whether it existed.
    async fn delete_user(&self, user_id: &str) -> Result<bool, RepositoryError>;

    async fn room_member_ids(&self, room_id: &str) -> Result<Vec<String>, RepositoryError>;

    /// Increment the unread counter of every membership in the room whose
    /// counter is below `ceiling`. Returns how many were incremented.
    async fn increment_unread(&self, room_id: &str, ceiling: u32) -> Result<u64, RepositoryError>;

    /// Increment one membership's reply counter if it is below `ceiling`.
    /// Returns whether it was incremented.
    async fn increment_replies(
        &self,
        room_id: &str,
        user_id: &str,
        ceiling: u32,
    ) -> Result<bool, RepositoryError>;

    async fn find_message(&self, message_id: &str) -> Result<Option<Message>, RepositoryError>;

    async fn save_vote_tally(&self, tally: &VoteTally) -> Result<(), RepositoryError>;

    /// Rooms for the given ids; unknown ids are omitted.
    async fn find_rooms(&self, room_ids: &[String]) -> Result<Vec<Room>, RepositoryError>;

    /// One page of room ids in ascending order, starting after `after`.
    async fn room_ids_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, RepositoryError>;
}
