//! Event payloads carried on the backbone streams.
//!
//! Every stream entry holds one `(kind, payload)` field pair: a short kind tag
//! and a UTF-8 JSON body. [`Event`] is the decoded form; dispatch matches on it
//! exhaustively so adding a variant forces every handler table to be updated.
//!
//! # Example
//!
//! ```json
//! ["unread-increment", "{\"roomId\":\"GENERAL\",\"messageId\":\"m1\"}"]
//! ```

use crate::store::StreamEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Stream carrying account removals.
pub const REMOVE_USER_STREAM: &str = "chat:users:remove";
/// Stream carrying room-wide unread counter bumps.
pub const UNREAD_STREAM: &str = "chat:rooms:unread";
/// Stream carrying per-user thread reply counter bumps.
pub const REPLY_STREAM: &str = "chat:rooms:replies";
/// Stream carrying poll vote recounts.
pub const VOTE_STREAM: &str = "chat:messages:votes";
/// Stream carrying search index bootstrap/update triggers.
pub const SEARCH_STREAM: &str = "chat:search";
/// Stream carrying background jobs.
pub const JOB_STREAM: &str = "chat:jobs";
/// Stream carrying per-user client notifications for live delivery.
pub const NOTIFICATION_STREAM: &str = "chat:notifications";

/// Errors decoding a stream entry into an [`Event`].
#[derive(Debug, Error)]
pub enum EventError {
    /// The entry had no fields at all
    #[error("entry has no fields")]
    Empty,

    /// The kind tag is not one this service understands
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    /// The kind requires a JSON body but none was present
    #[error("event kind '{0}' requires a payload")]
    MissingPayload(EventKind),

    /// The JSON body did not match the kind's schema
    #[error("invalid payload for '{kind}': {source}")]
    InvalidPayload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Kind tag written as the first field name of every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RemoveUser,
    UnreadIncrement,
    ReplyIncrement,
    VoteRecount,
    SearchSync,
    Job,
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::RemoveUser,
        EventKind::UnreadIncrement,
        EventKind::ReplyIncrement,
        EventKind::VoteRecount,
        EventKind::SearchSync,
        EventKind::Job,
        EventKind::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RemoveUser => "remove-user",
            EventKind::UnreadIncrement => "unread-increment",
            EventKind::ReplyIncrement => "reply-increment",
            EventKind::VoteRecount => "vote-recount",
            EventKind::SearchSync => "search-sync",
            EventKind::Job => "job",
            EventKind::Message => "message",
        }
    }

    /// The stream this kind is published to by default.
    pub fn stream(&self) -> &'static str {
        match self {
            EventKind::RemoveUser => REMOVE_USER_STREAM,
            EventKind::UnreadIncrement => UNREAD_STREAM,
            EventKind::ReplyIncrement => REPLY_STREAM,
            EventKind::VoteRecount => VOTE_STREAM,
            EventKind::SearchSync => SEARCH_STREAM,
            EventKind::Job => JOB_STREAM,
            EventKind::Message => NOTIFICATION_STREAM,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownKind(s.to_string()))
    }
}

/// Every stream the backbone consumes, one consumer loop each.
pub fn all_streams() -> Vec<&'static str> {
    EventKind::ALL.iter().map(|kind| kind.stream()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveUser {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadIncrement {
    pub room_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyIncrement {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecount {
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSyncMode {
    /// Create the index and point the alias at it
    Init,
    /// Reindex the listed rooms
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSync {
    pub mode: SearchSyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_ids: Option<Vec<String>>,
}

impl SearchSync {
    pub fn init() -> Self {
        Self {
            mode: SearchSyncMode::Init,
            room_ids: None,
        }
    }

    pub fn update(room_ids: Vec<String>) -> Self {
        Self {
            mode: SearchSyncMode::Update,
            room_ids: Some(room_ids),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Page through every room and republish search updates
    SearchResync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "type")]
    pub job_type: JobType,
}

/// A pre-serialized notification for one client.
///
/// `cmd` names the client-side command; `user`, when present, addresses the
/// notification to that user's live connections. Any other fields are passed
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientNotification {
    pub cmd: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ClientNotification {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            user: None,
            body: Map::new(),
        }
    }

    /// Add a pass-through field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    /// Address the notification to a user
    pub fn for_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// A decoded backbone event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RemoveUser(RemoveUser),
    UnreadIncrement(UnreadIncrement),
    ReplyIncrement(ReplyIncrement),
    VoteRecount(VoteRecount),
    SearchSync(SearchSync),
    Job(Job),
    Message(ClientNotification),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RemoveUser(_) => EventKind::RemoveUser,
            Event::UnreadIncrement(_) => EventKind::UnreadIncrement,
            Event::ReplyIncrement(_) => EventKind::ReplyIncrement,
            Event::VoteRecount(_) => EventKind::VoteRecount,
            Event::SearchSync(_) => EventKind::SearchSync,
            Event::Job(_) => EventKind::Job,
            Event::Message(_) => EventKind::Message,
        }
    }

    /// Serialize the JSON body for this event.
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Event::RemoveUser(p) => serde_json::to_string(p),
            Event::UnreadIncrement(p) => serde_json::to_string(p),
            Event::ReplyIncrement(p) => serde_json::to_string(p),
            Event::VoteRecount(p) => serde_json::to_string(p),
            Event::SearchSync(p) => serde_json::to_string(p),
            Event::Job(p) => serde_json::to_string(p),
            Event::Message(p) => serde_json::to_string(p),
        }
    }

    /// The `(kind, payload)` field pair written to the stream.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        Ok(vec![(self.kind().as_str().to_string(), self.payload_json()?)])
    }

    /// Decode an event from its kind tag and raw JSON body.
    pub fn decode(kind: &str, payload: Option<&str>) -> Result<Self, EventError> {
        let kind: EventKind = kind.parse()?;
        let body = payload.ok_or(EventError::MissingPayload(kind))?;
        let invalid = |source| EventError::InvalidPayload { kind, source };

        let event = match kind {
            EventKind::RemoveUser => Event::RemoveUser(serde_json::from_str(body).map_err(invalid)?),
            EventKind::UnreadIncrement => {
                Event::UnreadIncrement(serde_json::from_str(body).map_err(invalid)?)
            }
            EventKind::ReplyIncrement => {
                Event::ReplyIncrement(serde_json::from_str(body).map_err(invalid)?)
            }
            EventKind::VoteRecount => {
                Event::VoteRecount(serde_json::from_str(body).map_err(invalid)?)
            }
            EventKind::SearchSync => Event::SearchSync(serde_json::from_str(body).map_err(invalid)?),
            EventKind::Job => Event::Job(serde_json::from_str(body).map_err(invalid)?),
            EventKind::Message => Event::Message(serde_json::from_str(body).map_err(invalid)?),
        };
        Ok(event)
    }

    /// Decode an event from a stream entry.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self, EventError> {
        let kind = entry.kind().ok_or(EventError::Empty)?;
        Self::decode(kind, entry.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_tags_roundtrip_through_from_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!(matches!(
            "nope".parse::<EventKind>(),
            Err(EventError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_decode_unread_increment() {
        let event = Event::decode(
            "unread-increment",
            Some(r#"{"roomId":"GENERAL","messageId":"m1"}"#),
        )
        .unwrap();
        assert_eq!(
            event,
            Event::UnreadIncrement(UnreadIncrement {
                room_id: "GENERAL".to_string(),
                message_id: "m1".to_string(),
            })
        );
        assert_eq!(event.kind().stream(), UNREAD_STREAM);
    }

    #[test]
    fn test_decode_search_sync_modes() {
        let init = Event::decode("search-sync", Some(r#"{"mode":"init"}"#)).unwrap();
        assert_eq!(init, Event::SearchSync(SearchSync::init()));

        let update =
            Event::decode("search-sync", Some(r#"{"mode":"update","roomIds":["a","b"]}"#)).unwrap();
        assert_eq!(
            update,
            Event::SearchSync(SearchSync::update(vec!["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn test_decode_job() {
        let job = Event::decode("job", Some(r#"{"type":"search-resync"}"#)).unwrap();
        assert_eq!(
            job,
            Event::Job(Job {
                job_type: JobType::SearchResync
            })
        );

        let unknown = Event::decode("job", Some(r#"{"type":"reboot"}"#));
        assert!(matches!(unknown, Err(EventError::InvalidPayload { .. })));
    }

    #[test]
    fn test_notification_keeps_extra_fields() {
        let raw = r#"{"cmd":"message.votes","user":"u1","messageId":"m1","total":3}"#;
        let event = Event::decode("message", Some(raw)).unwrap();
        let Event::Message(notification) = event else {
            panic!("expected message event");
        };
        assert_eq!(notification.cmd, "message.votes");
        assert_eq!(notification.user.as_deref(), Some("u1"));
        assert_eq!(notification.body["total"], json!(3));

        let out: Value = serde_json::from_str(&serde_json::to_string(&notification).unwrap()).unwrap();
        assert_eq!(out["messageId"], json!("m1"));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Event::decode("remove-user", None),
            Err(EventError::MissingPayload(EventKind::RemoveUser))
        ));
        assert!(matches!(
            Event::decode("remove-user", Some("{not json")),
            Err(EventError::InvalidPayload { .. })
        ));
        assert!(matches!(
            Event::from_entry(&StreamEntry::new("1-0", Vec::new())),
            Err(EventError::Empty)
        ));
    }

    #[test]
    fn test_to_fields() {
        let event = Event::RemoveUser(RemoveUser {
            user_id: "u1".to_string(),
        });
        let fields = event.to_fields().unwrap();
        assert_eq!(fields[0].0, "remove-user");
        assert_eq!(fields[0].1, r#"{"userId":"u1"}"#);
    }

    #[test]
    fn test_all_streams_distinct() {
        let mut streams = all_streams();
        streams.sort();
        streams.dedup();
        assert_eq!(streams.len(), EventKind::ALL.len());
    }
}
