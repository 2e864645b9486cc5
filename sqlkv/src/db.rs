//! Core KeyValueDb implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{create_storage, Storage};
use futures::future::BoxFuture;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::iterator::KeyValueIterator;
use crate::model::{Bucket, IterateOptions, Key, Value, LOOKUP_LIMIT};

/// The key-value interface over a relational table.
///
/// Every operation comes in two forms: one addressing the default bucket and
/// a `_path` form addressing an explicit [`Bucket`]. Keys are ordered by
/// their raw bytes within a bucket.
///
/// # Thread Safety
///
/// `KeyValueDb` is designed to be shared across tasks. All operations take
/// `&self`; concurrent writers are arbitrated by the database, not by locks
/// held in this process.
///
/// # Example
///
/// ```ignore
/// use sqlkv::{Config, Key, KeyValueDb};
/// use bytes::Bytes;
///
/// let kv = KeyValueDb::open(config).await?;
///
/// kv.put(Key::from("user/123"), Bytes::from("alice")).await?;
/// assert_eq!(kv.get(Key::from("user/123")).await?, Bytes::from("alice"));
///
/// // Replace the value only if nobody changed it meanwhile
/// kv.compare_and_swap(
///     Key::from("user/123"),
///     Some(Bytes::from("alice")),
///     Some(Bytes::from("alicia")),
/// )
/// .await?;
///
/// kv.delete(Key::from("user/123")).await?;
/// ```
pub struct KeyValueDb {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) config: Config,
}

impl KeyValueDb {
    /// Opens a key-value store with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend cannot be reached.
    pub async fn open(config: Config) -> Result<Self> {
        let storage = create_storage(&config.storage).await?;
        Ok(Self::with_storage(storage, config))
    }

    /// Creates a KeyValueDb from an existing storage implementation.
    ///
    /// `config.storage` is ignored.
    pub fn with_storage(storage: Arc<dyn Storage>, config: Config) -> Self {
        Self { storage, config }
    }

    /// Stores `value` under `key` in the default bucket, replacing any
    /// existing value.
    pub async fn put(&self, key: Key, value: Value) -> Result<()> {
        self.put_path(&Bucket::default(), key, value).await
    }

    /// Stores `value` under `key` in `bucket`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] for a zero-length key, or a storage error
    /// if the write fails.
    pub async fn put_path(&self, bucket: &Bucket, key: Key, value: Value) -> Result<()> {
        check_key(&key)?;
        let put = self.storage.put(bucket.as_ref(), key.as_ref(), &value);
        with_timeout(self.config.operation_timeout, "put", put).await
    }

    /// Returns the value stored under `key` in the default bucket.
    pub async fn get(&self, key: Key) -> Result<Value> {
        self.get_path(&Bucket::default(), key).await
    }

    /// Returns the value stored under `key` in `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] for a zero-length key and
    /// [`Error::KeyNotFound`] if there is no record.
    pub async fn get_path(&self, bucket: &Bucket, key: Key) -> Result<Value> {
        check_key(&key)?;
        let get = self.storage.get(bucket.as_ref(), key.as_ref());
        let value = with_timeout(self.config.operation_timeout, "get", get).await?;
        value.ok_or(Error::KeyNotFound(key))
    }

    /// Looks up many keys of the default bucket at once.
    pub async fn get_all(&self, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.get_all_path(&Bucket::default(), keys).await
    }

    /// Looks up many keys of `bucket` at once.
    ///
    /// The result has one slot per key, in the order of `keys`, holding `None`
    /// where no record exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LimitExceeded`] when more than [`LOOKUP_LIMIT`] keys
    /// are requested.
    pub async fn get_all_path(&self, bucket: &Bucket, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        if keys.len() > LOOKUP_LIMIT {
            return Err(Error::LimitExceeded {
                requested: keys.len(),
                limit: LOOKUP_LIMIT,
            });
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<Bytes> = keys.iter().map(|key| key.as_bytes().clone()).collect();
        let get_many = self.storage.get_many(bucket.as_ref(), &keys);
        with_timeout(self.config.operation_timeout, "get_all", get_many).await
    }

    /// Removes `key` from the default bucket.
    pub async fn delete(&self, key: Key) -> Result<()> {
        self.delete_path(&Bucket::default(), key).await
    }

    /// Removes `key` from `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] for a zero-length key and
    /// [`Error::KeyNotFound`] if there was no record to remove.
    pub async fn delete_path(&self, bucket: &Bucket, key: Key) -> Result<()> {
        check_key(&key)?;
        let delete = self.storage.delete(bucket.as_ref(), key.as_ref());
        let deleted = with_timeout(self.config.operation_timeout, "delete", delete).await?;
        if deleted == 0 {
            return Err(Error::KeyNotFound(key));
        }
        Ok(())
    }

    /// Lists keys of the default bucket in order, starting at `first`.
    pub async fn list(&self, first: Key, limit: usize) -> Result<Vec<Key>> {
        self.list_path(&Bucket::default(), first, limit).await
    }

    /// Lists up to `limit` keys of `bucket` in ascending order, starting at
    /// `first` (inclusive) or the start of the bucket when `first` is empty.
    ///
    /// A `limit` of zero or above [`LOOKUP_LIMIT`] lists [`LOOKUP_LIMIT`] keys.
    pub async fn list_path(&self, bucket: &Bucket, first: Key, limit: usize) -> Result<Vec<Key>> {
        let limit = if limit == 0 || limit > LOOKUP_LIMIT {
            LOOKUP_LIMIT
        } else {
            limit
        };
        let options = IterateOptions {
            first,
            recurse: true,
            ..Default::default()
        };
        let list = self.iterate_path(bucket, options, move |iter| {
            Box::pin(collect_keys(iter, limit))
        });
        with_timeout(self.config.operation_timeout, "list", list).await
    }

    /// Iterates over the default bucket.
    pub async fn iterate<T, F>(&self, options: IterateOptions, consumer: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut KeyValueIterator) -> BoxFuture<'a, Result<T>>,
    {
        self.iterate_path(&Bucket::default(), options, consumer).await
    }

    /// Hands `consumer` an ordered cursor over the keys of `bucket` selected
    /// by `options`.
    ///
    /// The cursor is closed once the consumer returns, whether it succeeded or
    /// not. When both the consumer and closing the cursor fail, both failures
    /// are returned as [`Error::Combined`].
    ///
    /// # Example
    ///
    /// ```ignore
    /// let keys = kv
    ///     .iterate(IterateOptions { prefix: Key::from("user/"), ..Default::default() }, |iter| {
    ///         Box::pin(async move {
    ///             let mut keys = Vec::new();
    ///             while let Some(item) = iter.next().await? {
    ///                 keys.push(item.key);
    ///             }
    ///             Ok(keys)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn iterate_path<T, F>(
        &self,
        bucket: &Bucket,
        options: IterateOptions,
        consumer: F,
    ) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut KeyValueIterator) -> BoxFuture<'a, Result<T>>,
    {
        let mut iter = KeyValueIterator::new(
            Arc::clone(&self.storage),
            bucket.clone(),
            options,
            self.config.batch_size,
            self.config.operation_timeout,
        );
        let result = consumer(&mut iter).await;
        let closed = iter.close().await;
        Error::combine(result, closed)
    }

    /// Closes the store, releasing the storage backend.
    pub async fn close(self) -> Result<()> {
        self.storage.close().await?;
        Ok(())
    }
}

pub(crate) fn check_key(key: &Key) -> Result<()> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    Ok(())
}

/// Awaits `operation`, failing with [`Error::Cancelled`] once `timeout`
/// elapses.
pub(crate) async fn with_timeout<T, E, F>(
    timeout: Option<Duration>,
    name: &str,
    operation: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    Error: From<E>,
{
    let Some(timeout) = timeout else {
        return Ok(operation.await?);
    };
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Cancelled(format!(
            "{} did not complete within {:?}",
            name, timeout
        ))),
    }
}

async fn collect_keys(iter: &mut KeyValueIterator, limit: usize) -> Result<Vec<Key>> {
    let mut keys = Vec::new();
    while keys.len() < limit {
        match iter.next().await? {
            Some(item) => keys.push(item.key),
            None => break,
        }
    }
    Ok(keys)
}
