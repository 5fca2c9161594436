//! In-memory chat repository.

use super::{
    ChatRepository, Membership, Message, RemovedUser, RepositoryError, Room, User, VoteTally,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    users: HashMap<String, User>,
    /// Keyed by (room id, user id)
    memberships: BTreeMap<(String, String), Membership>,
    removed: HashMap<String, RemovedUser>,
    rooms: BTreeMap<String, Room>,
    messages: HashMap<String, Message>,
    tallies: HashMap<String, VoteTally>,
}

/// Repository kept in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<State>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id.clone(), user);
    }

    pub async fn insert_room(&self, room: Room) {
        self.state.write().await.rooms.insert(room.id.clone(), room);
    }

    pub async fn insert_message(&self, message: Message) {
        self.state
            .write()
            .await
            .messages
            .insert(message.id.clone(), message);
    }

    /// Add a membership with zeroed counters.
    pub async fn add_membership(&self, room_id: &str, user_id: &str) {
        self.put_membership(Membership {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            unread: 0,
            replies: 0,
        })
        .await;
    }

    pub async fn put_membership(&self, membership: Membership) {
        self.state.write().await.memberships.insert(
            (membership.room_id.clone(), membership.user_id.clone()),
            membership,
        );
    }

    pub async fn membership(&self, room_id: &str, user_id: &str) -> Option<Membership> {
        self.state
            .read()
            .await
            .memberships
            .get(&(room_id.to_string(), user_id.to_string()))
            .cloned()
    }

    pub async fn membership_count(&self, user_id: &str) -> usize {
        self.state
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .count()
    }

    pub async fn removed_count(&self) -> usize {
        self.state.read().await.removed.len()
    }

    pub async fn vote_tally(&self, message_id: &str) -> Option<VoteTally> {
        self.state.read().await.tallies.get(message_id).cloned()
    }
}

#[async_trait]
impl ChatRepository for MemoryRepository {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn user_room_ids(&self, user_id: &str) -> Result<Vec<String>, RepositoryError> {
        Ok(self
            .state
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.room_id.clone())
            .collect())
    }

    async fn upsert_removed_user(&self, removed: &RemovedUser) -> Result<(), RepositoryError> {
        self.state
            .write()
            .await
            .removed
            .insert(removed.id.clone(), removed.clone());
        Ok(())
    }

    async fn find_removed_user(&self, user_id: &str) -> Result<Option<RemovedUser>, RepositoryError> {
        Ok(self.state.read().await.removed.get(user_id).cloned())
    }

    async fn delete_memberships(&self, user_id: &str) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let before = state.memberships.len();
        state.memberships.retain(|_, m| m.user_id != user_id);
        Ok((before - state.memberships.len()) as u64)
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.state.write().await.users.remove(user_id).is_some())
    }

    async fn room_member_ids(&self, room_id: &str) -> Result<Vec<String>, RepositoryError> {
        Ok(self
            .state
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.room_id == room_id)
            .map(|m| m.user_id.clone())
            .collect())
    }

    async fn increment_unread(&self, room_id: &str, ceiling: u32) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let mut bumped = 0;
        for membership in state
            .memberships
            .values_mut()
            .filter(|m| m.room_id == room_id)
        {
            if membership.unread < ceiling {
                membership.unread += 1;
                bumped += 1;
            }
        }
        Ok(bumped)
    }

    async fn increment_replies(
        &self,
        room_id: &str,
        user_id: &str,
        ceiling: u32,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        match state
            .memberships
            .get_mut(&(room_id.to_string(), user_id.to_string()))
        {
            Some(membership) if membership.replies < ceiling => {
                membership.replies += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_message(&self, message_id: &str) -> Result<Option<Message>, RepositoryError> {
        Ok(self.state.read().await.messages.get(message_id).cloned())
    }

    async fn save_vote_tally(&self, tally: &VoteTally) -> Result<(), RepositoryError> {
        self.state
            .write()
            .await
            .tallies
            .insert(tally.message_id.clone(), tally.clone());
        Ok(())
    }

    async fn find_rooms(&self, room_ids: &[String]) -> Result<Vec<Room>, RepositoryError> {
        let state = self.state.read().await;
        Ok(room_ids
            .iter()
            .filter_map(|id| state.rooms.get(id).cloned())
            .collect())
    }

    async fn room_ids_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state
            .rooms
            .keys()
            .filter(|id| after.map_or(true, |after| id.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }
}
