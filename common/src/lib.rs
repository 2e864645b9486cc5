//! Storage contract shared by the sqlkv crates.
//!
//! The [`Storage`] traits describe a single `(bucket, key) -> value` table with
//! point reads and writes, ordered range scans and serializable transactions.
//! Backends are selected through [`StorageConfig`]: an in-memory table for
//! tests and a PostgreSQL/CockroachDB table for production use.

pub mod bytes;
pub mod storage;

pub use bytes::{lex_increment, BytesRange};
pub use storage::config::{PostgresStorageConfig, StorageConfig};
pub use storage::factory::create_storage;
pub use storage::tx::{execute_tx, RetryPolicy, Retryable};
pub use storage::{
    Record, ScanOrder, Storage, StorageError, StorageIterator, StorageRead, StorageResult,
    Transaction,
};
