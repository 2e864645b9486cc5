use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ScanOrder, Storage, Transaction};
use crate::{BytesRange, Record, StorageError, StorageIterator, StorageRead, StorageResult};

/// A stored value tagged with the version of the write that produced it.
#[derive(Clone, Debug)]
struct StoredValue {
    value: Bytes,
    version: u64,
}

/// The `(bucket, key) -> value` table, one ordered map per bucket.
#[derive(Debug, Default)]
struct Tables {
    buckets: BTreeMap<Bytes, BTreeMap<Bytes, StoredValue>>,
    last_version: u64,
}

impl Tables {
    fn lookup(&self, bucket: &[u8], key: &[u8]) -> Option<&StoredValue> {
        self.buckets.get(bucket).and_then(|rows| rows.get(key))
    }

    fn version(&self, bucket: &[u8], key: &[u8]) -> Option<u64> {
        self.lookup(bucket, key).map(|stored| stored.version)
    }

    /// Writes or (with `None`) removes a record. Every write gets a fresh
    /// version, so a delete followed by a re-insert is still observable.
    fn write(&mut self, bucket: Bytes, key: Bytes, value: Option<Bytes>) {
        self.last_version += 1;
        match value {
            Some(value) => {
                let stored = StoredValue {
                    value,
                    version: self.last_version,
                };
                self.buckets.entry(bucket).or_default().insert(key, stored);
            }
            None => {
                if let Some(rows) = self.buckets.get_mut(&bucket) {
                    rows.remove(&key);
                    if rows.is_empty() {
                        self.buckets.remove(&bucket);
                    }
                }
            }
        }
    }
}

/// In-memory implementation of the Storage trait.
///
/// Transactions are optimistic: reads record the version they observed and
/// writes are buffered. Commit validates that every observed version is still
/// current and fails with [`StorageError::Conflict`] otherwise, which gives
/// serializable isolation for the point reads the transactions perform.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStorage {
    /// Creates a new InMemoryStorage instance with an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, Tables>> {
        read_tables(&self.tables)
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, Tables>> {
        write_tables(&self.tables)
    }
}

fn read_tables(tables: &RwLock<Tables>) -> StorageResult<RwLockReadGuard<'_, Tables>> {
    tables
        .read()
        .map_err(|e| StorageError::Internal(format!("Failed to acquire read lock: {}", e)))
}

fn write_tables(tables: &RwLock<Tables>) -> StorageResult<RwLockWriteGuard<'_, Tables>> {
    tables
        .write()
        .map_err(|e| StorageError::Internal(format!("Failed to acquire write lock: {}", e)))
}

#[async_trait]
impl StorageRead for InMemoryStorage {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>> {
        let tables = self.read()?;
        Ok(tables.lookup(bucket, key).map(|stored| stored.value.clone()))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get_many(&self, bucket: &[u8], keys: &[Bytes]) -> StorageResult<Vec<Option<Bytes>>> {
        let tables = self.read()?;
        Ok(keys
            .iter()
            .map(|key| tables.lookup(bucket, key).map(|stored| stored.value.clone()))
            .collect())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn scan_iter(
        &self,
        bucket: &[u8],
        range: BytesRange,
        order: ScanOrder,
        limit: usize,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>> {
        let tables = self.read()?;

        let records: Vec<Record> = match tables.buckets.get(bucket) {
            Some(rows) if !range.is_empty() => {
                let rows = rows.range((range.start.clone(), range.end.clone()));
                let to_record = |(k, stored): (&Bytes, &StoredValue)| {
                    Record::new(k.clone(), stored.value.clone())
                };
                match order {
                    ScanOrder::Ascending => rows.take(limit).map(to_record).collect(),
                    ScanOrder::Descending => rows.rev().take(limit).map(to_record).collect(),
                }
            }
            _ => Vec::new(),
        };

        Ok(Box::new(InMemoryIterator {
            records: records.into_iter(),
        }))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut tables = self.write()?;
        tables.write(
            Bytes::copy_from_slice(bucket),
            Bytes::copy_from_slice(key),
            Some(Bytes::copy_from_slice(value)),
        );
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn insert_if_absent(
        &self,
        bucket: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> StorageResult<bool> {
        let mut tables = self.write()?;
        if tables.lookup(bucket, key).is_some() {
            return Ok(false);
        }
        tables.write(
            Bytes::copy_from_slice(bucket),
            Bytes::copy_from_slice(key),
            Some(Bytes::copy_from_slice(value)),
        );
        Ok(true)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn delete(&self, bucket: &[u8], key: &[u8]) -> StorageResult<u64> {
        let mut tables = self.write()?;
        if tables.lookup(bucket, key).is_none() {
            return Ok(0);
        }
        tables.write(
            Bytes::copy_from_slice(bucket),
            Bytes::copy_from_slice(key),
            None,
        );
        Ok(1)
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

struct InMemoryIterator {
    records: std::vec::IntoIter<Record>,
}

#[async_trait]
impl StorageIterator for InMemoryIterator {
    async fn next(&mut self) -> StorageResult<Option<Record>> {
        Ok(self.records.next())
    }
}

type Coordinate = (Bytes, Bytes);

struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    /// Version observed by the first read of each coordinate, `None` if absent.
    reads: HashMap<Coordinate, Option<u64>>,
    writes: BTreeMap<Coordinate, Option<Bytes>>,
}

impl InMemoryTransaction {
    fn read(&mut self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>> {
        let coordinate = (Bytes::copy_from_slice(bucket), Bytes::copy_from_slice(key));
        if let Some(pending) = self.writes.get(&coordinate) {
            return Ok(pending.clone());
        }

        let tables = read_tables(&self.tables)?;
        let stored = tables.lookup(bucket, key);
        let version = stored.map(|s| s.version);
        match self.reads.entry(coordinate) {
            Entry::Vacant(entry) => {
                entry.insert(version);
            }
            Entry::Occupied(entry) if *entry.get() != version => {
                return Err(conflict(bucket, key));
            }
            Entry::Occupied(_) => {}
        }
        Ok(stored.map(|s| s.value.clone()))
    }
}

fn conflict(bucket: &[u8], key: &[u8]) -> StorageError {
    StorageError::Conflict(format!(
        "record {:?} in bucket {:?} was modified by a concurrent transaction",
        Bytes::copy_from_slice(key),
        Bytes::copy_from_slice(bucket)
    ))
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn get(&mut self, bucket: &[u8], key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.read(bucket, key)
    }

    async fn update_if_value(
        &mut self,
        bucket: &[u8],
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> StorageResult<u64> {
        if self.read(bucket, key)?.as_deref() != Some(expected) {
            return Ok(0);
        }
        self.writes.insert(
            (Bytes::copy_from_slice(bucket), Bytes::copy_from_slice(key)),
            Some(Bytes::copy_from_slice(value)),
        );
        Ok(1)
    }

    async fn delete_if_value(
        &mut self,
        bucket: &[u8],
        key: &[u8],
        expected: &[u8],
    ) -> StorageResult<u64> {
        if self.read(bucket, key)?.as_deref() != Some(expected) {
            return Ok(0);
        }
        self.writes.insert(
            (Bytes::copy_from_slice(bucket), Bytes::copy_from_slice(key)),
            None,
        );
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let this = *self;
        let mut tables = write_tables(&this.tables)?;
        for ((bucket, key), seen) in &this.reads {
            if tables.version(bucket, key) != *seen {
                return Err(conflict(bucket, key));
            }
        }
        for ((bucket, key), value) in this.writes {
            tables.write(bucket, key, value);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
