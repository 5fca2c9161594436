//! Connection multiplexer for live delivery.
//!
//! Maps a user id to the output channels of that user's currently open live
//! connections. The transport registers a channel when a connection opens and
//! drains the matching receiver onto its socket; [`Multiplexer::publish`]
//! writes each frame (payload bytes followed by a single `0x00` delimiter) to
//! every channel registered for the user.
//!
//! The map lives in process memory, so delivery only reaches connections held
//! by this process.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

/// Byte written after every frame.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Output side of one live connection.
pub type Channel = UnboundedSender<Vec<u8>>;

/// Identifies one registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// User id to live channels. Cheap to clone; clones share the map.
#[derive(Clone, Default)]
pub struct Multiplexer {
    connections: Arc<RwLock<HashMap<String, HashMap<ConnectionId, Channel>>>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel pair for a new connection.
    pub fn channel() -> (Channel, UnboundedReceiver<Vec<u8>>) {
        mpsc::unbounded_channel()
    }

    /// Register `channel` as a live connection of `user`.
    pub async fn register(&self, user: &str, channel: Channel) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections
            .write()
            .await
            .entry(user.to_string())
            .or_default()
            .insert(id, channel);

        debug!(user = %user, connection = %id, "Connection registered");
        id
    }

    /// Remove a connection; the user's entry goes away with its last channel.
    pub async fn unregister(&self, user: &str, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(channels) = connections.get_mut(user) else {
            return false;
        };

        let removed = channels.remove(&id).is_some();
        if channels.is_empty() {
            connections.remove(user);
        }

        if removed {
            debug!(user = %user, connection = %id, "Connection unregistered");
        }
        removed
    }

    /// Write `bytes` plus the delimiter to every channel of `user`.
    ///
    /// Returns how many channels accepted the frame. Channels whose receiver
    /// has gone away are dropped.
    pub async fn publish(&self, user: &str, bytes: &[u8]) -> usize {
        let mut frame = Vec::with_capacity(bytes.len() + 1);
        frame.extend_from_slice(bytes);
        frame.push(FRAME_DELIMITER);

        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let connections = self.connections.read().await;
            let Some(channels) = connections.get(user) else {
                trace!(user = %user, "No live connections, nothing to publish");
                return 0;
            };

            for (id, channel) in channels {
                if channel.send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            self.unregister(user, id).await;
        }

        debug!(user = %user, delivered, bytes = bytes.len(), "Frame published");
        delivered
    }

    /// Number of live connections registered for `user`.
    pub async fn connection_count(&self, user: &str) -> usize {
        self.connections
            .read()
            .await
            .get(user)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Number of users with at least one live connection.
    pub async fn user_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_channel_of_user_only() {
        let mux = Multiplexer::new();
        let (tx1, mut rx1) = Multiplexer::channel();
        let (tx2, mut rx2) = Multiplexer::channel();
        let (tx_other, mut rx_other) = Multiplexer::channel();

        mux.register("u", tx1).await;
        mux.register("u", tx2).await;
        mux.register("other", tx_other).await;

        assert_eq!(mux.publish("u", b"{\"cmd\":\"x\"}").await, 2);

        let expected = b"{\"cmd\":\"x\"}\0".to_vec();
        assert_eq!(rx1.try_recv().unwrap(), expected);
        assert_eq!(rx2.try_recv().unwrap(), expected);
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_connections_is_noop() {
        let mux = Multiplexer::new();
        assert_eq!(mux.publish("nobody", b"hi").await, 0);
        assert_eq!(mux.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_deletes_empty_user_entry() {
        let mux = Multiplexer::new();
        let (tx1, _rx1) = Multiplexer::channel();
        let (tx2, _rx2) = Multiplexer::channel();

        let first = mux.register("u", tx1).await;
        let second = mux.register("u", tx2).await;
        assert_eq!(mux.connection_count("u").await, 2);

        assert!(mux.unregister("u", first).await);
        assert_eq!(mux.user_count().await, 1);
        assert!(!mux.unregister("u", first).await);

        assert!(mux.unregister("u", second).await);
        assert_eq!(mux.user_count().await, 0);
        assert_eq!(mux.connection_count("u").await, 0);
    }

    #[tokio::test]
    async fn test_closed_channels_are_pruned() {
        let mux = Multiplexer::new();
        let (tx_open, mut rx_open) = Multiplexer::channel();
        let (tx_closed, rx_closed) = Multiplexer::channel();
        mux.register("u", tx_open).await;
        mux.register("u", tx_closed).await;
        drop(rx_closed);

        assert_eq!(mux.publish("u", b"a").await, 1);
        assert_eq!(mux.connection_count("u").await, 1);
        assert_eq!(rx_open.try_recv().unwrap(), b"a\0".to_vec());
    }
}
