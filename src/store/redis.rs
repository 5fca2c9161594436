//! Redis-backed store over a deadpool connection pool.
//!
//! Stream operations map onto `XADD`/`XREADGROUP`/`XACK`/`XGROUP`/`XAUTOCLAIM`,
//! leases onto `SET NX PX` and a compare-and-delete script.

use super::{EntryId, KeyValueStore, StartPosition, StoreError, StreamEntry, StreamStore};
use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, RedisError, Script, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;
use tracing::{debug, error};

/// Deletes `KEYS[1]` only while it still holds `ARGV[1]`.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Store handle backed by Redis. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pooled store from a `redis://` URL.
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// The underlying pool, shared with other Redis-backed components.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Round-trip a `PING` to check connectivity.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            StoreError::Connection(e.to_string())
        })
    }
}

/// Classify a Redis error for a group-scoped command.
fn group_error(stream: &str, group: &str, e: RedisError) -> StoreError {
    match e.code() {
        Some("BUSYGROUP") => StoreError::GroupExists {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        Some("NOGROUP") => StoreError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        _ => StoreError::Command(e.to_string()),
    }
}

fn value_to_string(value: &RedisValue) -> String {
    match value {
        RedisValue::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        RedisValue::SimpleString(s) => s.clone(),
        RedisValue::Int(n) => n.to_string(),
        _ => String::new(),
    }
}

/// `BLOCK 0` waits forever, so a zero block still times out after 1 ms.
fn block_millis(block: Duration) -> usize {
    block.as_millis().max(1) as usize
}

/// Entries of an `XAUTOCLAIM` reply: `[cursor, [[id, [field, value, ...]], ...], deleted]`.
///
/// Entries deleted from the stream show up as nil on older servers and are
/// skipped.
fn parse_claimed(reply: &RedisValue) -> Vec<StreamEntry> {
    let RedisValue::Array(parts) = reply else {
        return Vec::new();
    };
    let Some(RedisValue::Array(claimed)) = parts.get(1) else {
        return Vec::new();
    };

    claimed
        .iter()
        .filter_map(|entry| {
            let RedisValue::Array(entry) = entry else {
                return None;
            };
            let id = value_to_string(entry.first()?);
            let RedisValue::Array(raw_fields) = entry.get(1)? else {
                return None;
            };
            let fields = raw_fields
                .chunks_exact(2)
                .map(|pair| (value_to_string(&pair[0]), value_to_string(&pair[1])))
                .collect();
            Some(StreamEntry::new(id, fields))
        })
        .collect()
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn append(
        &self,
        stream: &str,
        max_len: usize,
        fields: &[(String, String)],
    ) -> Result<EntryId, StoreError> {
        let mut conn = self.connection().await?;

        let mut xadd = cmd("XADD");
        xadd.arg(stream).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (key, value) in fields {
            xadd.arg(key).arg(value);
        }

        let id: String = xadd
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.connection().await?;

        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(block_millis(block))
            .count(count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(|e| group_error(stream, group, e))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for element in key.ids {
                let mut fields: Vec<(String, String)> = element
                    .map
                    .iter()
                    .map(|(name, value)| (name.clone(), value_to_string(value)))
                    .collect();
                // Entries carry a single pair; sorting keeps multi-field entries deterministic.
                fields.sort();
                entries.push(StreamEntry::new(element.id, fields));
            }
        }

        debug!(stream = %stream, group = %group, count = entries.len(), "Read stream batch");
        Ok(entries)
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.connection().await?;

        let reply: RedisValue = cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(stream, group, e))?;

        let entries = parse_claimed(&reply);
        debug!(stream = %stream, group = %group, count = entries.len(), "Claimed pending entries");
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let acked: u64 = conn
            .xack(stream, group, &[id])
            .await
            .map_err(|e| group_error(stream, group, e))?;
        Ok(acked > 0)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        make_stream: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let mut xgroup = cmd("XGROUP");
        xgroup
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start.as_redis_id());
        if make_stream {
            xgroup.arg("MKSTREAM");
        }

        let _: () = xgroup
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(stream, group, e))?;
        Ok(())
    }

    async fn set_group_cursor(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = cmd("XGROUP")
            .arg("SETID")
            .arg(stream)
            .arg(group)
            .arg(start.as_redis_id())
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(stream, group, e))?;
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let reply: StreamPendingReply = conn
            .xpending(stream, group)
            .await
            .map_err(|e| group_error(stream, group, e))?;
        Ok(reply.count() as u64)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let len: u64 = conn
            .xlen(stream)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(len)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(removed > 0)
    }
}
