//! In-memory store with Redis stream and lease semantics.
//!
//! Each [`MemoryStore`] is an isolated instance; clones share state. Used by
//! tests and by single-process development setups without Redis.

use super::{EntryId, KeyValueStore, StartPosition, StoreError, StreamEntry, StreamStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// `(millis, sequence)` pair ordering entries like Redis stream ids.
type Position = (u64, u64);

#[derive(Default)]
struct MemoryGroup {
    last_delivered: Position,
    /// Pending entries with the consumer they were delivered to, and when
    pending: BTreeMap<Position, (String, Instant)>,
}

#[derive(Default)]
struct MemoryStream {
    entries: VecDeque<(Position, Vec<(String, String)>)>,
    last_id: Position,
    groups: HashMap<String, MemoryGroup>,
}

impl MemoryStream {
    fn next_position(&mut self) -> Position {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let next = if now > self.last_id.0 {
            (now, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = next;
        next
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, MemoryStream>,
    leases: HashMap<String, (String, Instant)>,
}

/// Process-local store implementing [`StreamStore`] and [`KeyValueStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn format_id(position: Position) -> EntryId {
    format!("{}-{}", position.0, position.1)
}

fn parse_id(id: &str) -> Option<Position> {
    let (millis, seq) = id.split_once('-')?;
    Some((millis.parse().ok()?, seq.parse().ok()?))
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn append(
        &self,
        stream: &str,
        max_len: usize,
        fields: &[(String, String)],
    ) -> Result<EntryId, StoreError> {
        let id = {
            let mut state = self.state.lock().await;
            let entry_stream = state.streams.entry(stream.to_string()).or_default();
            let position = entry_stream.next_position();
            entry_stream.entries.push_back((position, fields.to_vec()));
            while entry_stream.entries.len() > max_len.max(1) {
                entry_stream.entries.pop_front();
            }
            format_id(position)
        };
        self.appended.notify_waiters();
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
        let deadline = Instant::now() + block;

        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                let entry_stream = state
                    .streams
                    .get_mut(stream)
                    .ok_or_else(|| no_group(stream, group))?;
                let MemoryStream {
                    entries, groups, ..
                } = entry_stream;
                let cursor = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

                let batch: Vec<StreamEntry> = entries
                    .iter()
                    .filter(|(position, _)| *position > cursor.last_delivered)
                    .take(count)
                    .map(|(position, fields)| StreamEntry::new(format_id(*position), fields.clone()))
                    .collect();

                if !batch.is_empty() {
                    let now = Instant::now();
                    for entry in &batch {
                        if let Some(position) = parse_id(&entry.id) {
                            cursor.last_delivered = position;
                            cursor.pending.insert(position, (consumer.to_string(), now));
                        }
                    }
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut state = self.state.lock().await;
        let entry_stream = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let MemoryStream {
            entries, groups, ..
        } = entry_stream;
        let cursor = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let idle: Vec<Position> = cursor
            .pending
            .iter()
            .filter(|(_, (_, delivered_at))| now.duration_since(*delivered_at) >= min_idle)
            .map(|(position, _)| *position)
            .take(count)
            .collect();

        let mut claimed = Vec::with_capacity(idle.len());
        for position in idle {
            match entries.iter().find(|(retained, _)| *retained == position) {
                Some((_, fields)) => {
                    cursor.pending.insert(position, (consumer.to_string(), now));
                    claimed.push(StreamEntry::new(format_id(position), fields.clone()));
                }
                None => {
                    cursor.pending.remove(&position);
                }
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError> {
        let Some(position) = parse_id(id) else {
            return Err(StoreError::Command(format!("invalid stream id '{}'", id)));
        };

        let mut state = self.state.lock().await;
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&position).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        make_stream: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        if !state.streams.contains_key(stream) {
            if !make_stream {
                return Err(StoreError::Command(format!(
                    "stream '{}' does not exist",
                    stream
                )));
            }
            state.streams.insert(stream.to_string(), MemoryStream::default());
        }

        let entry_stream = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        if entry_stream.groups.contains_key(group) {
            return Err(StoreError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }

        let last_delivered = match start {
            StartPosition::Beginning => (0, 0),
            StartPosition::Newest => entry_stream.last_id,
        };
        entry_stream.groups.insert(
            group.to_string(),
            MemoryGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn set_group_cursor(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry_stream = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let last_id = entry_stream.last_id;
        let cursor = entry_stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        cursor.last_delivered = match start {
            StartPosition::Beginning => (0, 0),
            StartPosition::Newest => last_id,
        };
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| no_group(stream, group))
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some((_, expires_at)) = state.leases.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        state
            .leases
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        match state.leases.get(key) {
            Some((current, expires_at)) if current == value && *expires_at > now => {
                state.leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(kind: &str, payload: &str) -> Vec<(String, String)> {
        vec![(kind.to_string(), payload.to_string())]
    }

    #[tokio::test]
    async fn test_fresh_group_at_start_reads_all_in_order() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for n in 0..5 {
            let id = store
                .append("s", 100, &fields("job", &format!("{{\"n\":{}}}", n)))
                .await
                .unwrap();
            ids.push(id);
        }

        store
            .create_group("s", "g", StartPosition::Beginning, false)
            .await
            .unwrap();
        let entries = store
            .read_group("s", "g", "c1", 100, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(entries.len(), 5);
        let read_ids: Vec<_> = entries.iter().map(|e| e.id.clone()).collect();
        assert_eq!(read_ids, ids);
        assert_eq!(entries[3].payload(), Some("{\"n\":3}"));
    }

    #[tokio::test]
    async fn test_group_at_newest_skips_backlog() {
        let store = MemoryStore::new();
        store.append("s", 100, &fields("job", "{}")).await.unwrap();
        store
            .create_group("s", "g", StartPosition::Newest, false)
            .await
            .unwrap();

        let entries = store
            .read_group("s", "g", "c1", 100, Duration::ZERO)
            .await
            .unwrap();
        assert!(entries.is_empty());

        store.append("s", 100, &fields("job", "{}")).await.unwrap();
        let entries = store
            .read_group("s", "g", "c1", 100, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_pending_and_repeat_is_noop() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", StartPosition::Beginning, true)
            .await
            .unwrap();
        let id = store.append("s", 100, &fields("job", "{}")).await.unwrap();

        store
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 1);

        assert!(store.ack("s", "g", &id).await.unwrap());
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 0);

        assert!(!store.ack("s", "g", &id).await.unwrap());
        assert!(!store.ack("s", "g", "999-0").await.unwrap());
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_takes_over_idle_entries() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", StartPosition::Beginning, true)
            .await
            .unwrap();
        let first = store.append("s", 100, &fields("job", "{\"n\":1}")).await.unwrap();
        store.append("s", 100, &fields("job", "{\"n\":2}")).await.unwrap();

        store
            .read_group("s", "g", "crashed", 10, Duration::ZERO)
            .await
            .unwrap();

        // Not idle long enough yet
        let claimed = store
            .claim_pending("s", "g", "c2", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let claimed = store
            .claim_pending("s", "g", "c2", Duration::from_secs(30), 1)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first);
        assert_eq!(claimed[0].payload(), Some("{\"n\":1}"));

        // The claim reset its idle time; only the other entry is still idle
        let claimed = store
            .claim_pending("s", "g", "c2", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_ne!(claimed[0].id, first);
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_drops_trimmed_entries() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", StartPosition::Beginning, true)
            .await
            .unwrap();
        store.append("s", 2, &fields("job", "{}")).await.unwrap();
        store
            .read_group("s", "g", "crashed", 10, Duration::ZERO)
            .await
            .unwrap();
        store.append("s", 2, &fields("job", "{}")).await.unwrap();
        store.append("s", 2, &fields("job", "{}")).await.unwrap();

        let claimed = store
            .claim_pending("s", "g", "c2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_requires_group() {
        let store = MemoryStore::new();
        let err = store
            .claim_pending("s", "g", "c", Duration::ZERO, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_read_respects_count() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", StartPosition::Beginning, true)
            .await
            .unwrap();
        for _ in 0..7 {
            store.append("s", 100, &fields("job", "{}")).await.unwrap();
        }

        let first = store.read_group("s", "g", "c", 5, Duration::ZERO).await.unwrap();
        let second = store.read_group("s", "g", "c", 5, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_append_trims_oldest() {
        let store = MemoryStore::new();
        for _ in 0..10 {
            store.append("s", 3, &fields("job", "{}")).await.unwrap();
        }
        assert_eq!(store.stream_len("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_create_group_twice_reports_exists() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", StartPosition::Newest, true)
            .await
            .unwrap();
        let err = store
            .create_group("s", "g", StartPosition::Newest, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::GroupExists { .. }));
    }

    #[tokio::test]
    async fn test_create_group_without_stream() {
        let store = MemoryStore::new();
        let err = store
            .create_group("missing", "g", StartPosition::Newest, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
    }

    #[tokio::test]
    async fn test_set_cursor_requires_group() {
        let store = MemoryStore::new();
        let err = store
            .set_group_cursor("s", "g", StartPosition::Newest)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", StartPosition::Newest, true)
            .await
            .unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("s", 100, &fields("job", "{}")).await.unwrap();
        });

        let entries = store
            .read_group("s", "g", "c", 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let store = MemoryStore::new();
        store
            .create_group("s", "g", StartPosition::Newest, true)
            .await
            .unwrap();

        let entries = store
            .read_group("s", "g", "c", 10, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "a", Duration::from_millis(100))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", "b", Duration::from_millis(100))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(store
            .set_if_absent("k", "b", Duration::from_millis(100))
            .await
            .unwrap());
        assert!(!store.delete_if_equals("k", "a").await.unwrap());
        assert!(store.delete_if_equals("k", "b").await.unwrap());
    }
}
