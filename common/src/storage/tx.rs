//! Re-running transactions aborted by serialization conflicts.
//!
//! [`execute_tx`] runs a transactional closure inside [`Storage::begin`] /
//! commit, and re-runs it from scratch whenever the attempt fails with an
//! error classified as retryable. The closure must therefore have no effects
//! outside the transaction it is handed.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Storage, StorageError, Transaction};

/// Classifies errors into transient conflicts worth re-running and
/// everything else.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Bounds how often and how quickly a conflicting transaction is re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubled on each further retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for the backoff, before jitter.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given failed attempt (1-based).
    ///
    /// Exponential in the attempt number, capped at `max_delay`, plus a random
    /// jitter of up to a quarter of the capped delay so that colliding
    /// transactions do not retry in lockstep.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        let spread = (delay.as_micros() / 4) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        delay + Duration::from_micros(jitter)
    }
}

/// Runs `body` in a serializable transaction, committing on success.
///
/// When the body or the commit fails with a retryable error, the transaction
/// is rolled back and the body re-run, up to `policy.max_attempts` attempts.
/// Errors that are not retryable, and the last retryable error once the
/// budget is exhausted, are returned to the caller.
pub async fn execute_tx<T, E, F>(
    storage: &dyn Storage,
    policy: &RetryPolicy,
    mut body: F,
) -> Result<T, E>
where
    E: From<StorageError> + Retryable + std::fmt::Display,
    F: for<'t> FnMut(&'t mut Box<dyn Transaction>) -> BoxFuture<'t, Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut tx = storage.begin().await?;
        let result = body(&mut tx).await;
        let outcome = match result {
            Ok(value) => tx.commit().await.map(|()| value).map_err(E::from),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(err)
            }
        };

        match outcome {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::debug!(attempt, ?backoff, "retrying transaction after conflict: {}", err);
                tokio::time::sleep(backoff).await;
            }
            outcome => return outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::storage::in_memory::InMemoryStorage;
    use crate::storage::ScanOrder;
    use crate::{BytesRange, StorageIterator, StorageRead, StorageResult};

    /// Delegates to in-memory storage but fails the first `conflicts` commits.
    struct ConflictingStorage {
        inner: InMemoryStorage,
        conflicts: Arc<AtomicU32>,
    }

    impl ConflictingStorage {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: InMemoryStorage::new(),
                conflicts: Arc::new(AtomicU32::new(conflicts)),
            }
        }
    }

    struct ConflictingTransaction {
        inner: Box<dyn Transaction>,
        conflicts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StorageRead for ConflictingStorage {
        async fn get(&self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>> {
            self.inner.get(bucket, key).await
        }

        async fn get_many(
            &self,
            bucket: &[u8],
            keys: &[Bytes],
        ) -> StorageResult<Vec<Option<Bytes>>> {
            self.inner.get_many(bucket, keys).await
        }

        async fn scan_iter(
            &self,
            bucket: &[u8],
            range: BytesRange,
            order: ScanOrder,
            limit: usize,
        ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>> {
            self.inner.scan_iter(bucket, range, order, limit).await
        }
    }

    #[async_trait]
    impl Storage for ConflictingStorage {
        async fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> StorageResult<()> {
            self.inner.put(bucket, key, value).await
        }

        async fn insert_if_absent(
            &self,
            bucket: &[u8],
            key: &[u8],
            value: &[u8],
        ) -> StorageResult<bool> {
            self.inner.insert_if_absent(bucket, key, value).await
        }

        async fn delete(&self, bucket: &[u8], key: &[u8]) -> StorageResult<u64> {
            self.inner.delete(bucket, key).await
        }

        async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
            Ok(Box::new(ConflictingTransaction {
                inner: self.inner.begin().await?,
                conflicts: Arc::clone(&self.conflicts),
            }))
        }

        async fn close(&self) -> StorageResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transaction for ConflictingTransaction {
        async fn get(&mut self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>> {
            self.inner.get(bucket, key).await
        }

        async fn update_if_value(
            &mut self,
            bucket: &[u8],
            key: &[u8],
            expected: &[u8],
            value: &[u8],
        ) -> StorageResult<u64> {
            self.inner
                .update_if_value(bucket, key, expected, value)
                .await
        }

        async fn delete_if_value(
            &mut self,
            bucket: &[u8],
            key: &[u8],
            expected: &[u8],
        ) -> StorageResult<u64> {
            self.inner.delete_if_value(bucket, key, expected).await
        }

        async fn commit(self: Box<Self>) -> StorageResult<()> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                self.inner.rollback().await?;
                return Err(StorageError::Conflict("injected".to_string()));
            }
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> StorageResult<()> {
            self.inner.rollback().await
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    /// Bumps a counter stored under `counter` by one, inside the transaction.
    fn increment<'t>(
        tx: &'t mut Box<dyn Transaction>,
        runs: Arc<AtomicU32>,
    ) -> BoxFuture<'t, Result<(), StorageError>> {
        Box::pin(async move {
            runs.fetch_add(1, Ordering::SeqCst);
            let current = tx.get(b"", b"counter").await?.unwrap_or_default();
            let next = (current.first().copied().unwrap_or(0) + 1).to_be_bytes();
            tx.update_if_value(b"", b"counter", &current, &next).await?;
            Ok(())
        })
    }

    #[tokio::test]
    async fn should_commit_on_first_attempt_without_conflict() {
        // given
        let storage = ConflictingStorage::new(0);
        storage.put(b"", b"counter", &[0]).await.unwrap();
        let runs = Arc::new(AtomicU32::new(0));

        // when
        let result = execute_tx(&storage, &fast_policy(3), |tx| increment(tx, runs.clone())).await;

        // then
        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            storage.get(b"", b"counter").await.unwrap(),
            Some(Bytes::from_static(&[1]))
        );
    }

    #[tokio::test]
    async fn should_rerun_body_after_commit_conflicts() {
        // given
        let storage = ConflictingStorage::new(2);
        storage.put(b"", b"counter", &[0]).await.unwrap();
        let runs = Arc::new(AtomicU32::new(0));

        // when
        let result = execute_tx(&storage, &fast_policy(5), |tx| increment(tx, runs.clone())).await;

        // then
        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            storage.get(b"", b"counter").await.unwrap(),
            Some(Bytes::from_static(&[1]))
        );
    }

    #[tokio::test]
    async fn should_surface_conflict_when_attempts_are_exhausted() {
        // given
        let storage = ConflictingStorage::new(10);
        storage.put(b"", b"counter", &[0]).await.unwrap();
        let runs = Arc::new(AtomicU32::new(0));

        // when
        let result = execute_tx(&storage, &fast_policy(3), |tx| increment(tx, runs.clone())).await;

        // then
        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            storage.get(b"", b"counter").await.unwrap(),
            Some(Bytes::from_static(&[0]))
        );
    }

    #[tokio::test]
    async fn should_not_retry_terminal_errors() {
        // given
        let storage = ConflictingStorage::new(0);
        let runs = Arc::new(AtomicU32::new(0));

        // when
        let result: Result<(), StorageError> = execute_tx(&storage, &fast_policy(5), |_tx| {
            let runs = runs.clone();
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Internal("broken".to_string()))
            })
        })
        .await;

        // then
        assert_eq!(result, Err(StorageError::Internal("broken".to_string())));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn should_cap_backoff_at_max_delay_plus_jitter() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };

        let first = policy.backoff(1);
        let late = policy.backoff(9);

        assert!(first >= Duration::from_millis(10) && first <= Duration::from_micros(12_500));
        assert!(late >= Duration::from_millis(100) && late <= Duration::from_millis(125));
    }

    #[test]
    fn should_deserialize_policy_with_humantime_durations() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 3, "base_delay": "5ms"}"#).unwrap();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(5));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
    }
}
