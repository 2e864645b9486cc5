//! Ordered iteration over one bucket in bounded batches.

use std::ops::Bound::Included;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{lex_increment, BytesRange, ScanOrder, Storage, StorageIterator};

use crate::db::with_timeout;
use crate::error::Result;
use crate::model::{Bucket, IterateOptions, Key, ListItem, DELIMITER};

/// A forward cursor over the keys of a bucket, in byte order (descending when
/// iterating in reverse).
///
/// Records are pulled from storage in batches of at most `batch_size`. Each
/// batch resumes strictly after the last key handed out, so the consumer sees
/// every key in the range exactly once regardless of the batch size.
pub struct KeyValueIterator {
    storage: Arc<dyn Storage>,
    bucket: Bucket,
    prefix: Bytes,
    recurse: bool,
    order: ScanOrder,
    /// The part of the keyspace not handed out yet.
    range: BytesRange,
    batch_size: usize,
    timeout: Option<Duration>,
    batch: Option<Box<dyn StorageIterator + Send + 'static>>,
    batch_len: usize,
    exhausted: bool,
}

impl KeyValueIterator {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        bucket: Bucket,
        options: IterateOptions,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> Self {
        let prefix = options.prefix.into_bytes();
        let mut range = BytesRange::prefix(prefix.clone());
        if !options.first.is_empty() {
            let first = options.first.into_bytes();
            range = if options.reverse {
                range.end_at(first)
            } else {
                range.start_at(first)
            };
        }
        let order = if options.reverse {
            ScanOrder::Descending
        } else {
            ScanOrder::Ascending
        };

        Self {
            storage,
            bucket,
            prefix,
            recurse: options.recurse,
            order,
            range,
            batch_size: batch_size.max(1),
            timeout,
            batch: None,
            batch_len: 0,
            exhausted: false,
        }
    }

    /// Returns the next item, or None once the range is exhausted.
    pub async fn next(&mut self) -> Result<Option<ListItem>> {
        loop {
            if self.batch.is_none() {
                if self.exhausted || self.range.is_empty() {
                    self.exhausted = true;
                    return Ok(None);
                }
                self.fetch_batch().await?;
            }
            let next = match self.batch.as_mut() {
                Some(batch) => batch.next().await?,
                None => None,
            };

            let record = match next {
                Some(record) => record,
                None => {
                    // a short batch means storage has nothing left in range
                    if self.batch_len < self.batch_size {
                        self.exhausted = true;
                    }
                    self.close_batch().await?;
                    continue;
                }
            };
            self.batch_len += 1;

            if !self.recurse {
                if let Some(namespace) = self.nested_namespace(&record.key) {
                    self.skip_namespace(&namespace);
                    self.close_batch().await?;
                    return Ok(Some(ListItem {
                        key: Key::from(namespace),
                        value: Bytes::new(),
                        is_prefix: true,
                    }));
                }
            }

            match self.order {
                ScanOrder::Ascending => self.range.resume_after(record.key.clone()),
                ScanOrder::Descending => self.range.resume_before(record.key.clone()),
            }
            return Ok(Some(ListItem {
                key: Key::from(record.key),
                value: record.value,
                is_prefix: false,
            }));
        }
    }

    /// Releases the batch in flight. Further calls to [`next`](Self::next)
    /// return None.
    pub async fn close(&mut self) -> Result<()> {
        self.exhausted = true;
        self.close_batch().await
    }

    async fn fetch_batch(&mut self) -> Result<()> {
        let fetch = self.storage.scan_iter(
            self.bucket.as_ref(),
            self.range.clone(),
            self.order,
            self.batch_size,
        );
        let batch = with_timeout(self.timeout, "iterate", fetch).await?;
        self.batch = Some(batch);
        self.batch_len = 0;
        Ok(())
    }

    async fn close_batch(&mut self) -> Result<()> {
        if let Some(mut batch) = self.batch.take() {
            batch.close().await?;
        }
        Ok(())
    }

    /// Returns `prefix + remainder[..=delimiter]` when the key lies in a
    /// namespace nested below the prefix.
    fn nested_namespace(&self, key: &Bytes) -> Option<Bytes> {
        let remainder = key.get(self.prefix.len()..)?;
        let end = remainder.iter().position(|&b| b == DELIMITER)?;
        Some(key.slice(..self.prefix.len() + end + 1))
    }

    /// Removes every key of `namespace` from the range still to be scanned.
    fn skip_namespace(&mut self, namespace: &Bytes) {
        match self.order {
            ScanOrder::Ascending => match lex_increment(namespace) {
                Some(next) => self.range.start = Included(next),
                None => self.exhausted = true,
            },
            ScanOrder::Descending => self.range.resume_before(namespace.clone()),
        }
    }
}
