//! Atomic compare-and-swap on top of serializable transactions.

use common::execute_tx;

use crate::db::{check_key, with_timeout, KeyValueDb};
use crate::error::{Error, Result};
use crate::model::{Bucket, Key, Value};

impl KeyValueDb {
    /// Compare-and-swap in the default bucket.
    pub async fn compare_and_swap(
        &self,
        key: Key,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<()> {
        self.compare_and_swap_path(&Bucket::default(), key, old, new)
            .await
    }

    /// Atomically replaces the value of `key` in `bucket` with `new`, provided
    /// its current value is `old`.
    ///
    /// `old = None` requires that no record exists; `new = None` removes the
    /// record. With both `None` the call only asserts that the key is absent.
    /// Values are compared byte for byte, so an empty value is not the same as
    /// a missing one.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyKey`] for a zero-length key.
    /// - [`Error::KeyNotFound`] when `old` is set but there is no record.
    /// - [`Error::ValueChanged`] when the current value is not `old`.
    /// - A storage error once serialization conflicts exhaust the retry
    ///   budget.
    #[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
    pub async fn compare_and_swap_path(
        &self,
        bucket: &Bucket,
        key: Key,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<()> {
        check_key(&key)?;
        let swap = self.swap(bucket, key, old, new);
        with_timeout(self.config.operation_timeout, "compare_and_swap", swap).await
    }

    async fn swap(
        &self,
        bucket: &Bucket,
        key: Key,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<()> {
        match (old, new) {
            (None, None) => {
                if self.storage.get(bucket.as_ref(), key.as_ref()).await?.is_some() {
                    return Err(Error::ValueChanged(key));
                }
                Ok(())
            }
            (None, Some(new)) => {
                let inserted = self
                    .storage
                    .insert_if_absent(bucket.as_ref(), key.as_ref(), &new)
                    .await?;
                if !inserted {
                    return Err(Error::ValueChanged(key));
                }
                Ok(())
            }
            (Some(old), new) => {
                execute_tx(self.storage.as_ref(), &self.config.retry, |tx| {
                    let (bucket, key, old, new) =
                        (bucket.clone(), key.clone(), old.clone(), new.clone());
                    Box::pin(async move {
                        let Some(current) = tx.get(bucket.as_ref(), key.as_ref()).await? else {
                            return Err(Error::KeyNotFound(key));
                        };
                        if current != old {
                            return Err(Error::ValueChanged(key));
                        }

                        let affected = match new {
                            Some(new) => {
                                tx.update_if_value(bucket.as_ref(), key.as_ref(), &old, &new)
                                    .await?
                            }
                            None => {
                                tx.delete_if_value(bucket.as_ref(), key.as_ref(), &old)
                                    .await?
                            }
                        };
                        if affected != 1 {
                            return Err(Error::ValueChanged(key));
                        }
                        Ok(())
                    })
                })
                .await
            }
        }
    }
}
