//! sqlkv - A key-value store over a serializable relational database.
//!
//! sqlkv maps a bucket-scoped key-value contract onto a single table of a
//! PostgreSQL-compatible database (PostgreSQL or CockroachDB). The database
//! provides durability and transactional isolation; this crate provides the
//! key-value semantics on top, including atomic compare-and-swap and ordered,
//! resumable iteration.
//!
//! # Architecture
//!
//! [`KeyValueDb`] validates requests and translates them into calls on the
//! [`common::Storage`] contract. Compare-and-swap runs as a serializable
//! transaction that is re-run transparently when the database aborts it with
//! a serialization conflict. Iteration pulls records in bounded batches and
//! exposes them as a single ordered cursor, [`KeyValueIterator`].
//!
//! # Key Concepts
//!
//! - **Bucket**: a namespace; equal keys in different buckets are distinct
//!   records. Operations without the `_path` suffix use the default (empty)
//!   bucket.
//! - **Key**: opaque bytes, ordered byte-lexicographically. The empty key is
//!   reserved.
//! - **Value**: opaque bytes, possibly empty. "No value" is `None`.
//!
//! # Example
//!
//! ```ignore
//! use sqlkv::{Config, IterateOptions, Key, KeyValueDb};
//! use bytes::Bytes;
//!
//! let kv = KeyValueDb::open(config).await?;
//!
//! kv.put(Key::from("user/1"), Bytes::from("alice")).await?;
//! kv.put(Key::from("user/2"), Bytes::from("bob")).await?;
//!
//! // Create only if absent
//! kv.compare_and_swap(Key::from("user/3"), None, Some(Bytes::from("carol"))).await?;
//!
//! // List keys in order
//! let keys = kv.list(Key::from("user/"), 100).await?;
//! assert_eq!(keys.len(), 3);
//! ```

mod cas;
mod config;
mod db;
mod error;
mod iterator;
mod model;

pub use config::Config;
pub use db::KeyValueDb;
pub use error::{Error, Result};
pub use iterator::KeyValueIterator;
pub use model::{Bucket, IterateOptions, Key, ListItem, Value, DELIMITER, LOOKUP_LIMIT};
