//! Stream producer.
//!
//! Appends capped entries to the backbone streams. Each [`Event`] has a home
//! stream (see [`EventKind::stream`]); [`Producer::publish_to`] overrides it.

use crate::event::{ClientNotification, Event, EventKind};
use crate::store::{EntryId, StoreError, StreamStore};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Default approximate cap on stream length.
pub const DEFAULT_MAX_LEN: usize = 10_000;

/// Errors publishing an entry.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Appends events to streams through a shared [`StreamStore`].
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn StreamStore>,
    max_len: usize,
}

impl Producer {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self {
            store,
            max_len: DEFAULT_MAX_LEN,
        }
    }

    /// Set the approximate stream length cap
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Append `event` to its home stream.
    pub async fn publish(&self, event: &Event) -> Result<EntryId, ProducerError> {
        self.publish_to(event.kind().stream(), event).await
    }

    /// Append `event` to an explicit stream.
    pub async fn publish_to(&self, stream: &str, event: &Event) -> Result<EntryId, ProducerError> {
        let fields = event.to_fields()?;
        let id = self.store.append(stream, self.max_len, &fields).await?;

        debug!(
            id = %id,
            stream = %stream,
            kind = %event.kind(),
            "Entry published"
        );

        Ok(id)
    }

    /// Publish one message-fanout entry per user, each addressed to that user.
    ///
    /// This is O(n) appends for n recipients.
    pub async fn fanout_to_users<S: AsRef<str>>(
        &self,
        users: &[S],
        notification: &ClientNotification,
    ) -> Result<Vec<EntryId>, ProducerError> {
        let mut ids = Vec::with_capacity(users.len());
        for user in users {
            let addressed = notification.clone().for_user(user.as_ref());
            ids.push(self.publish(&Event::Message(addressed)).await?);
        }

        if !ids.is_empty() {
            info!(
                cmd = %notification.cmd,
                recipients = ids.len(),
                stream = %EventKind::Message.stream(),
                "Notification fanned out"
            );
        }

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RemoveUser, NOTIFICATION_STREAM, REMOVE_USER_STREAM};
    use crate::store::{MemoryStore, StartPosition};
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_routes_to_home_stream() {
        let store = Arc::new(MemoryStore::new());
        let producer = Producer::new(store.clone());

        producer
            .publish(&Event::RemoveUser(RemoveUser {
                user_id: "u1".to_string(),
            }))
            .await
            .unwrap();

        assert_eq!(store.stream_len(REMOVE_USER_STREAM).await.unwrap(), 1);
        assert_eq!(store.stream_len(NOTIFICATION_STREAM).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_caps_stream() {
        let store = Arc::new(MemoryStore::new());
        let producer = Producer::new(store.clone()).with_max_len(2);
        let event = Event::RemoveUser(RemoveUser {
            user_id: "u1".to_string(),
        });

        for _ in 0..5 {
            producer.publish_to("capped", &event).await.unwrap();
        }
        assert_eq!(store.stream_len("capped").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fanout_publishes_one_entry_per_user() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_group(NOTIFICATION_STREAM, "g", StartPosition::Beginning, true)
            .await
            .unwrap();
        let producer = Producer::new(store.clone());

        let notification = ClientNotification::new("user.removed")
            .with_field("userId", serde_json::json!("gone"));
        let ids = producer
            .fanout_to_users(&["a", "b", "c"], &notification)
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let entries = store
            .read_group(NOTIFICATION_STREAM, "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        let users: Vec<String> = entries
            .iter()
            .map(|e| match Event::from_entry(e).unwrap() {
                Event::Message(n) => n.user.unwrap(),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(users, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fanout_to_nobody() {
        let store = Arc::new(MemoryStore::new());
        let producer = Producer::new(store.clone());
        let ids = producer
            .fanout_to_users::<&str>(&[], &ClientNotification::new("noop"))
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(store.stream_len(NOTIFICATION_STREAM).await.unwrap(), 0);
    }
}
