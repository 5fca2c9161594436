//! Consumer-group registration.
//!
//! Groups are created once and survive restarts. On every boot the registrar
//! takes the `init:<stream>:<group>` lock, tries to reset the existing group's
//! cursor to the newest entry, and falls back to creating the group (and the
//! stream) when it does not exist yet. A concurrent creation reported as
//! "already exists" counts as success; any other failure aborts boot.

use crate::lock::{ExclusiveError, LockManager};
use crate::store::{StartPosition, StoreError, StreamStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Lease held while a group is being initialised.
const INIT_LOCK_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("failed to register group '{group}' on '{stream}': {source}")]
    Registration {
        stream: String,
        group: String,
        #[source]
        source: StoreError,
    },

    #[error("init lock error: {0}")]
    Lock(StoreError),
}

/// What a registration attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Existing group's cursor was moved
    Reset,
    /// Group was created
    Created,
    /// Another process created it concurrently
    AlreadyExists,
    /// Another process holds the init lock
    Skipped,
}

/// Registers consumer groups under the lock manager.
#[derive(Clone)]
pub struct Registrar {
    streams: Arc<dyn StreamStore>,
    locks: LockManager,
}

impl Registrar {
    pub fn new(streams: Arc<dyn StreamStore>, locks: LockManager) -> Self {
        Self { streams, locks }
    }

    /// Initialise `group` on `stream` so it reads entries appended from now on.
    pub async fn init_group(&self, stream: &str, group: &str) -> Result<Registration, RegistrarError> {
        self.init_group_at(stream, group, StartPosition::Newest).await
    }

    /// Initialise `group` on `stream` with an explicit start position.
    pub async fn init_group_at(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<Registration, RegistrarError> {
        let key = format!("init:{}:{}", stream, group);

        let outcome = self
            .locks
            .run_exclusive(&key, INIT_LOCK_TTL, || self.register(stream, group, start))
            .await;

        match outcome {
            Ok(Some(registration)) => Ok(registration),
            Ok(None) => {
                info!(
                    stream = %stream,
                    group = %group,
                    "Group initialisation in progress elsewhere, skipping"
                );
                Ok(Registration::Skipped)
            }
            Err(ExclusiveError::Task(e)) => Err(e),
            Err(ExclusiveError::Lock(e)) => Err(RegistrarError::Lock(e)),
        }
    }

    async fn register(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<Registration, RegistrarError> {
        match self.streams.set_group_cursor(stream, group, start).await {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Consumer group cursor reset");
                return Ok(Registration::Reset);
            }
            Err(e) => {
                info!(
                    stream = %stream,
                    group = %group,
                    reason = %e,
                    "Consumer group not resettable, creating"
                );
            }
        }

        match self.streams.create_group(stream, group, start, true).await {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(Registration::Created)
            }
            Err(StoreError::GroupExists { .. }) => {
                info!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(Registration::AlreadyExists)
            }
            Err(e) => {
                error!(stream = %stream, group = %group, error = %e, "Failed to create consumer group");
                Err(RegistrarError::Registration {
                    stream: stream.to_string(),
                    group: group.to_string(),
                    source: e,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore, StreamEntry};
    use async_trait::async_trait;

    fn registrar(store: &MemoryStore) -> Registrar {
        Registrar::new(
            Arc::new(store.clone()),
            LockManager::new(Arc::new(store.clone())),
        )
    }

    #[tokio::test]
    async fn test_first_run_creates_group_and_stream() {
        let store = MemoryStore::new();
        let outcome = registrar(&store).init_group("s", "g").await.unwrap();
        assert_eq!(outcome, Registration::Created);
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rerun_resets_without_discarding_pending() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);
        registrar.init_group("s", "g").await.unwrap();

        store.append("s", 100, &[("job".into(), "{}".into())]).await.unwrap();
        let delivered = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);

        let outcome = registrar.init_group("s", "g").await.unwrap();
        assert_eq!(outcome, Registration::Reset);
        assert_eq!(store.pending_count("s", "g").await.unwrap(), 1);

        // Lock was released after each run
        assert!(store
            .set_if_absent("init:s:g", "check", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_skips_when_lock_held() {
        let store = MemoryStore::new();
        store
            .set_if_absent("init:s:g", "other", Duration::from_secs(30))
            .await
            .unwrap();

        let outcome = registrar(&store).init_group("s", "g").await.unwrap();
        assert_eq!(outcome, Registration::Skipped);
        assert!(store.pending_count("s", "g").await.is_err());
    }

    /// Store whose group never resets and always reports a given create error.
    struct FailingStore {
        create_error: fn() -> StoreError,
    }

    #[async_trait]
    impl StreamStore for FailingStore {
        async fn append(&self, _: &str, _: usize, _: &[(String, String)]) -> Result<String, StoreError> {
            Ok("0-1".to_string())
        }
        async fn read_group(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: usize,
            _: Duration,
        ) -> Result<Vec<StreamEntry>, StoreError> {
            Ok(Vec::new())
        }
        async fn claim_pending(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Duration,
            _: usize,
        ) -> Result<Vec<StreamEntry>, StoreError> {
            Ok(Vec::new())
        }
        async fn ack(&self, _: &str, _: &str, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn create_group(
            &self,
            _: &str,
            _: &str,
            _: StartPosition,
            _: bool,
        ) -> Result<(), StoreError> {
            Err((self.create_error)())
        }
        async fn set_group_cursor(&self, stream: &str, group: &str, _: StartPosition) -> Result<(), StoreError> {
            Err(StoreError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })
        }
        async fn pending_count(&self, _: &str, _: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn stream_len(&self, _: &str) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn registrar_with(create_error: fn() -> StoreError) -> (Registrar, MemoryStore) {
        let locks = MemoryStore::new();
        let registrar = Registrar::new(
            Arc::new(FailingStore { create_error }),
            LockManager::new(Arc::new(locks.clone())),
        );
        (registrar, locks)
    }

    #[tokio::test]
    async fn test_concurrent_creation_is_success() {
        let (registrar, _) = registrar_with(|| StoreError::GroupExists {
            stream: "s".to_string(),
            group: "g".to_string(),
        });
        let outcome = registrar.init_group("s", "g").await.unwrap();
        assert_eq!(outcome, Registration::AlreadyExists);
    }

    #[tokio::test]
    async fn test_other_errors_are_fatal_and_release_lock() {
        let (registrar, locks) =
            registrar_with(|| StoreError::Command("WRONGTYPE Operation against a key".to_string()));

        let err = registrar.init_group("s", "g").await.unwrap_err();
        assert!(matches!(err, RegistrarError::Registration { .. }));
        assert!(locks
            .set_if_absent("init:s:g", "check", Duration::from_secs(1))
            .await
            .unwrap());
    }
}
