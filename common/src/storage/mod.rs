pub mod config;
pub mod factory;
pub mod in_memory;
pub mod postgres;
pub mod tx;

use async_trait::async_trait;
use bytes::Bytes;

use crate::BytesRange;

/// A key and its value as read back from a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Direction of a range scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanOrder {
    #[default]
    Ascending,
    Descending,
}

/// Error type for storage operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Connectivity, driver or statement errors
    Storage(String),
    /// The transaction was aborted because a concurrent transaction
    /// interfered with it. Re-running the transaction may succeed.
    Conflict(String),
    /// Internal errors
    Internal(String),
}

impl std::error::Error for StorageError {}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StorageError::Storage(msg) => write!(f, "Storage error: {}", msg),
            StorageError::Conflict(msg) => write!(f, "Serialization conflict: {}", msg),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Cursor over one batch of scanned records.
///
/// Callers must call [`close`](StorageIterator::close) once they are done,
/// whether or not the cursor was drained, so that backends holding server-side
/// resources can release them.
#[async_trait]
pub trait StorageIterator {
    async fn next(&mut self) -> StorageResult<Option<Record>>;

    async fn close(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

/// Read operations against the `(bucket, key) -> value` table.
#[async_trait]
pub trait StorageRead: Send + Sync {
    async fn get(&self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Looks up many keys of one bucket at once.
    ///
    /// The result has one slot per requested key, in request order, with
    /// `None` for keys that have no record.
    async fn get_many(&self, bucket: &[u8], keys: &[Bytes]) -> StorageResult<Vec<Option<Bytes>>>;

    /// Returns at most `limit` records of `bucket` within `range`, sorted by
    /// key in the requested order.
    async fn scan_iter(
        &self,
        bucket: &[u8],
        range: BytesRange,
        order: ScanOrder,
        limit: usize,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>>;
}

/// The storage type encapsulates access to the relational store.
#[async_trait]
pub trait Storage: StorageRead {
    /// Inserts the record or replaces the value of an existing one.
    async fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Inserts the record unless `(bucket, key)` already exists.
    ///
    /// Returns whether a row was inserted.
    async fn insert_if_absent(&self, bucket: &[u8], key: &[u8], value: &[u8])
        -> StorageResult<bool>;

    /// Deletes the record, returning the number of rows removed.
    async fn delete(&self, bucket: &[u8], key: &[u8]) -> StorageResult<u64>;

    /// Starts a serializable transaction.
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Closes the storage, releasing any resources.
    async fn close(&self) -> StorageResult<()>;
}

/// A serializable transaction over the `(bucket, key) -> value` table.
///
/// Any operation, including [`commit`](Transaction::commit), may fail with
/// [`StorageError::Conflict`]; the whole transaction must then be re-run.
/// A transaction dropped without commit or rollback is rolled back.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Replaces the value of `(bucket, key)` only while it still equals
    /// `expected`. Returns the number of rows updated.
    async fn update_if_value(
        &mut self,
        bucket: &[u8],
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> StorageResult<u64>;

    /// Deletes `(bucket, key)` only while its value equals `expected`.
    /// Returns the number of rows deleted.
    async fn delete_if_value(
        &mut self,
        bucket: &[u8],
        key: &[u8],
        expected: &[u8],
    ) -> StorageResult<u64>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}
