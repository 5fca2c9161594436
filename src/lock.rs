//! Lease-based distributed locking.
//!
//! A lock is a key holding an opaque owner token with an expiry. Acquisition is
//! a conditional "set if absent"; release deletes the key only while it still
//! holds the caller's token, so a holder whose lease expired and was reclaimed
//! by another process cannot release the new owner's lock.
//!
//! Contention is never an error: `false`/`None` means another process is
//! already doing the work and the caller should skip it.
//!
//! # Example
//!
//! ```rust,ignore
//! let locks = LockManager::new(store.clone());
//! let ran = locks
//!     .run_exclusive("search:init", Duration::from_secs(600), || async {
//!         index.bootstrap().await
//!     })
//!     .await?;
//! ```

use crate::store::{KeyValueStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure of a scoped critical section.
#[derive(Debug, Error)]
pub enum ExclusiveError<E> {
    /// The lock itself could not be acquired or released
    #[error("lock store error: {0}")]
    Lock(#[from] StoreError),

    /// The guarded work failed (the lock was still released)
    #[error("guarded task failed: {0}")]
    Task(E),
}

/// Lock manager over any [`KeyValueStore`].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// A fresh owner token.
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Try to take `key` for `ttl`. Returns whether the caller won.
    pub async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let acquired = self.store.set_if_absent(key, token, ttl).await?;
        debug!(key = %key, acquired, ttl_ms = ttl.as_millis() as u64, "Lock acquire");
        Ok(acquired)
    }

    /// Release `key` if it is still held by `token`. A mismatch is a no-op.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let released = self.store.delete_if_equals(key, token).await?;
        if !released {
            debug!(key = %key, "Lock no longer held by this token, nothing released");
        }
        Ok(released)
    }

    /// Run `task` while holding `key`.
    ///
    /// Returns `Ok(None)` without running `task` when the lock is held
    /// elsewhere. The lock is released after `task` completes, whether it
    /// succeeded or failed.
    pub async fn run_exclusive<F, Fut, T, E>(
        &self,
        key: &str,
        ttl: Duration,
        task: F,
    ) -> Result<Option<T>, ExclusiveError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = Self::new_token();
        if !self.acquire(key, &token, ttl).await? {
            return Ok(None);
        }

        let outcome = task().await;

        if let Err(e) = self.release(key, &token).await {
            warn!(key = %key, error = %e, "Failed to release lock; it will expire");
            if outcome.is_ok() {
                return Err(ExclusiveError::Lock(e));
            }
        }

        outcome.map(Some).map_err(ExclusiveError::Task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_holder_blocks_other_token_until_release() {
        let locks = manager();
        let ttl = Duration::from_secs(30);

        assert!(locks.acquire("k", "a", ttl).await.unwrap());
        assert!(!locks.acquire("k", "b", ttl).await.unwrap());

        assert!(!locks.release("k", "b").await.unwrap());
        assert!(!locks.acquire("k", "b", ttl).await.unwrap());

        assert!(locks.release("k", "a").await.unwrap());
        assert!(locks.acquire("k", "b", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_frees_lock_and_stale_release_is_noop() {
        let locks = manager();

        assert!(locks.acquire("k", "a", Duration::from_millis(50)).await.unwrap());
        tokio::time::advance(Duration::from_millis(60)).await;

        assert!(locks.acquire("k", "b", Duration::from_secs(30)).await.unwrap());
        // "a" lost its lease; its release must not free "b"'s lock
        assert!(!locks.release("k", "a").await.unwrap());
        assert!(!locks.acquire("k", "c", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_after_success() {
        let locks = manager();
        let ran = locks
            .run_exclusive("k", Duration::from_secs(30), || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(ran, Some(7));
        assert!(locks.acquire("k", "x", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_after_failure() {
        let locks = manager();
        let result = locks
            .run_exclusive("k", Duration::from_secs(30), || async {
                Err::<(), _>("boom".to_string())
            })
            .await;
        assert!(matches!(result, Err(ExclusiveError::Task(ref e)) if e == "boom"));
        assert!(locks.acquire("k", "x", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_exclusive_skips_when_held() {
        let locks = manager();
        assert!(locks.acquire("k", "other", Duration::from_secs(30)).await.unwrap());

        let mut ran = false;
        let result = locks
            .run_exclusive("k", Duration::from_secs(30), || {
                ran = true;
                async { Ok::<_, String>(()) }
            })
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!ran);
    }
}
