//! Data types for key-value operations.

use std::fmt;

use bytes::Bytes;

/// Maximum number of keys accepted by a single batch lookup, and the largest
/// page [`list`](crate::KeyValueDb::list) returns.
pub const LOOKUP_LIMIT: usize = 1000;

/// Separator of nested namespaces inside a key, used by non-recursive
/// iteration.
pub const DELIMITER: u8 = b'/';

/// A stored value. Values are opaque and may be empty; "no value" is expressed
/// as `Option<Value>::None`, never as an empty value.
pub type Value = Bytes;

/// An opaque, byte-ordered key.
///
/// The empty key is reserved: every operation addressing a single record
/// rejects it with [`Error::EmptyKey`](crate::Error::EmptyKey).
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Bytes);

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns true for the reserved zero-length key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Key {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static str> for Key {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&'static [u8]> for Key {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0.escape_ascii())
    }
}

/// A namespace partitioning the keyspace. Equal keys in different buckets are
/// different records. The default bucket is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket(Bytes);

impl Bucket {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl AsRef<[u8]> for Bucket {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static str> for Bucket {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Bytes> for Bucket {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// An entry produced by iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListItem {
    pub key: Key,
    /// The stored value; always empty for a collapsed prefix.
    pub value: Value,
    /// True when the item stands for every key below a nested namespace
    /// rather than for a single record.
    pub is_prefix: bool,
}

/// Options controlling [`iterate`](crate::KeyValueDb::iterate).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterateOptions {
    /// Only keys starting with this prefix are produced.
    pub prefix: Key,
    /// The first key produced, or the next one after it (the previous one
    /// when iterating in reverse). Empty means the start of the prefix range
    /// (its end in reverse).
    pub first: Key,
    /// When false, keys nested below `prefix` by [`DELIMITER`] are collapsed
    /// into a single prefix item per namespace.
    pub recurse: bool,
    /// Iterate in descending key order.
    pub reverse: bool,
}
