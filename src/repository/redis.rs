//! Redis-backed chat repository.
//!
//! # Key layout
//!
//! ```text
//! chat:user:{id}              JSON user record
//! chat:user:{id}:rooms        SET of room ids the user belongs to
//! chat:room:{id}              JSON room record
//! chat:room:{id}:unread       HASH user id -> unread counter (one field per member)
//! chat:room:{id}:replies      HASH user id -> reply counter
//! chat:rooms                  ZSET of room ids (score 0, paged lexicographically)
//! chat:message:{id}           JSON message record
//! chat:message:{id}:tally     JSON vote tally
//! chat:removed:{id}           JSON removed-user archive
//! ```
//!
//! Capped increments run as Lua scripts so the ceiling check and the
//! increment happen atomically per room.

use super::{ChatRepository, Message, RemovedUser, RepositoryError, Room, User, VoteTally};
use async_trait::async_trait;
use deadpool_redis::redis::{cmd, pipe, AsyncCommands, Script};
use deadpool_redis::{Connection, Pool};
use serde::de::DeserializeOwned;

/// Bumps every member counter in `KEYS[1]` that is below `ARGV[1]`.
const INCREMENT_ROOM_SCRIPT: &str = r#"
local bumped = 0
local counters = redis.call('HGETALL', KEYS[1])
for i = 1, #counters, 2 do
    if tonumber(counters[i + 1]) < tonumber(ARGV[1]) then
        redis.call('HINCRBY', KEYS[1], counters[i], 1)
        bumped = bumped + 1
    end
end
return bumped
"#;

/// Bumps `ARGV[1]`'s counter in `KEYS[2]` if it is a member per `KEYS[1]`
/// and below `ARGV[2]`.
const INCREMENT_MEMBER_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
    return 0
end
local current = tonumber(redis.call('HGET', KEYS[2], ARGV[1]) or '0')
if current < tonumber(ARGV[2]) then
    redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
    return 1
end
return 0
"#;

const ROOM_INDEX_KEY: &str = "chat:rooms";

fn user_key(id: &str) -> String {
    format!("chat:user:{}", id)
}

fn user_rooms_key(id: &str) -> String {
    format!("chat:user:{}:rooms", id)
}

fn room_key(id: &str) -> String {
    format!("chat:room:{}", id)
}

fn unread_key(room_id: &str) -> String {
    format!("chat:room:{}:unread", room_id)
}

fn replies_key(room_id: &str) -> String {
    format!("chat:room:{}:replies", room_id)
}

fn message_key(id: &str) -> String {
    format!("chat:message:{}", id)
}

fn tally_key(message_id: &str) -> String {
    format!("chat:message:{}:tally", message_id)
}

fn removed_key(id: &str) -> String {
    format!("chat:removed:{}", id)
}

fn command_error(e: deadpool_redis::redis::RedisError) -> RepositoryError {
    RepositoryError::Command(e.to_string())
}

fn decode<T: DeserializeOwned>(key: &str, raw: Option<String>) -> Result<Option<T>, RepositoryError> {
    raw.map(|json| {
        serde_json::from_str(&json).map_err(|source| RepositoryError::Corrupt {
            key: key.to_string(),
            source,
        })
    })
    .transpose()
}

/// Chat repository over a shared deadpool Redis pool.
#[derive(Clone)]
pub struct RedisRepository {
    pool: Pool,
}

impl RedisRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<Connection, RepositoryError> {
        self.pool
            .get()
            .await
            .map_err(|e| RepositoryError::Connection(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RepositoryError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(key).await.map_err(command_error)?;
        decode(key, raw)
    }

    async fn set_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.connection().await?;
        let _: () = conn.set(key, json).await.map_err(command_error)?;
        Ok(())
    }
}

#[async_trait]
impl ChatRepository for RedisRepository {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, RepositoryError> {
        self.get_json(&user_key(user_id)).await
    }

    async fn user_room_ids(&self, user_id: &str) -> Result<Vec<String>, RepositoryError> {
        let mut conn = self.connection().await?;
        let mut rooms: Vec<String> = conn
            .smembers(user_rooms_key(user_id))
            .await
            .map_err(command_error)?;
        rooms.sort();
        Ok(rooms)
    }

    async fn upsert_removed_user(&self, removed: &RemovedUser) -> Result<(), RepositoryError> {
        self.set_json(&removed_key(&removed.id), removed).await
    }

    async fn find_removed_user(&self, user_id: &str) -> Result<Option<RemovedUser>, RepositoryError> {
        self.get_json(&removed_key(user_id)).await
    }

    async fn delete_memberships(&self, user_id: &str) -> Result<u64, RepositoryError> {
        let rooms = self.user_room_ids(user_id).await?;
        let mut conn = self.connection().await?;

        let mut pipeline = pipe();
        pipeline.atomic();
        for room_id in &rooms {
            pipeline
                .hdel(unread_key(room_id), user_id)
                .ignore()
                .hdel(replies_key(room_id), user_id)
                .ignore();
        }
        pipeline.del(user_rooms_key(user_id)).ignore();

        let _: () = pipeline.query_async(&mut conn).await.map_err(command_error)?;
        Ok(rooms.len() as u64)
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, RepositoryError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(user_key(user_id)).await.map_err(command_error)?;
        Ok(removed > 0)
    }

    async fn room_member_ids(&self, room_id: &str) -> Result<Vec<String>, RepositoryError> {
        let mut conn = self.connection().await?;
        let mut members: Vec<String> = conn.hkeys(unread_key(room_id)).await.map_err(command_error)?;
        members.sort();
        Ok(members)
    }

    async fn increment_unread(&self, room_id: &str, ceiling: u32) -> Result<u64, RepositoryError> {
        let mut conn = self.connection().await?;
        let bumped: u64 = Script::new(INCREMENT_ROOM_SCRIPT)
            .key(unread_key(room_id))
            .arg(ceiling)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(bumped)
    }

    async fn increment_replies(
        &self,
        room_id: &str,
        user_id: &str,
        ceiling: u32,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.connection().await?;
        let bumped: u64 = Script::new(INCREMENT_MEMBER_SCRIPT)
            .key(unread_key(room_id))
            .key(replies_key(room_id))
            .arg(user_id)
            .arg(ceiling)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(bumped > 0)
    }

    async fn find_message(&self, message_id: &str) -> Result<Option<Message>, RepositoryError> {
        self.get_json(&message_key(message_id)).await
    }

    async fn save_vote_tally(&self, tally: &VoteTally) -> Result<(), RepositoryError> {
        self.set_json(&tally_key(&tally.message_id), tally).await
    }

    async fn find_rooms(&self, room_ids: &[String]) -> Result<Vec<Room>, RepositoryError> {
        if room_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = room_ids.iter().map(|id| room_key(id)).collect();
        let mut conn = self.connection().await?;
        let raw: Vec<Option<String>> = cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        let mut rooms = Vec::with_capacity(raw.len());
        for (key, json) in keys.iter().zip(raw) {
            if let Some(room) = decode::<Room>(key, json)? {
                rooms.push(room);
            }
        }
        Ok(rooms)
    }

    async fn room_ids_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, RepositoryError> {
        let min = after.map_or_else(|| "-".to_string(), |id| format!("({}", id));
        let mut conn = self.connection().await?;
        let ids: Vec<String> = cmd("ZRANGEBYLEX")
            .arg(ROOM_INDEX_KEY)
            .arg(min)
            .arg("+")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(ids)
    }
}
