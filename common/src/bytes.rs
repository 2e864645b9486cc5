//! Byte utilities for ordered key ranges.
//!
//! Keys are compared byte-lexicographically everywhere in the workspace, which
//! is also how PostgreSQL and CockroachDB order `BYTEA` columns. The helpers in
//! this module build and narrow ranges under that ordering.

use bytes::{Bytes, BytesMut};
use std::ops::Bound::{self, Excluded, Included, Unbounded};

/// Computes the lexicographic successor of every key starting with `data`.
///
/// Returns the smallest byte sequence that is greater than all sequences
/// having `data` as a prefix, or `None` when no such sequence exists (the input
/// is empty or consists only of `0xFF` bytes).
///
/// # Examples
///
/// - `"a"` → `Some("b")`
/// - `[0x61, 0xFF]` → `Some([0x62])`
/// - `[0xFF]` → `None`
pub fn lex_increment(data: &[u8]) -> Option<Bytes> {
    if data.is_empty() {
        return None;
    }

    let mut result = BytesMut::from(data);
    while let Some(last) = result.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(result.freeze());
        }
        result.truncate(result.len() - 1);
    }

    None
}

/// A range over byte sequences, used for key range queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytesRange {
    pub start: Bound<Bytes>,
    pub end: Bound<Bytes>,
}

impl BytesRange {
    pub fn new(start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self { start, end }
    }

    /// Creates a range that includes all keys with the given prefix.
    pub fn prefix(prefix: Bytes) -> Self {
        if prefix.is_empty() {
            return Self::unbounded();
        }
        let end = match lex_increment(&prefix) {
            Some(end) => Excluded(end),
            None => Unbounded,
        };
        Self {
            start: Included(prefix),
            end,
        }
    }

    /// Creates a range that scans everything.
    pub fn unbounded() -> Self {
        Self {
            start: Unbounded,
            end: Unbounded,
        }
    }

    pub fn contains(&self, k: &[u8]) -> bool {
        (match &self.start {
            Included(s) => k >= s,
            Excluded(s) => k > s,
            Unbounded => true,
        }) && (match &self.end {
            Included(e) => k <= e,
            Excluded(e) => k < e,
            Unbounded => true,
        })
    }

    /// Returns true when no key can fall inside the range.
    ///
    /// Backends must check this before handing the bounds to an ordered map:
    /// `BTreeMap::range` panics on inverted bounds.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (_, Excluded(e)) if e.is_empty() => true,
            (Included(s), Included(e)) => s > e,
            (Included(s), Excluded(e)) | (Excluded(s), Included(e)) | (Excluded(s), Excluded(e)) => {
                s >= e
            }
            _ => false,
        }
    }

    /// Raises the lower bound to `key` (inclusive) when that narrows the range.
    pub fn start_at(mut self, key: Bytes) -> Self {
        let narrower = match &self.start {
            Included(s) => key > *s,
            Excluded(s) => key > *s,
            Unbounded => true,
        };
        if narrower {
            self.start = Included(key);
        }
        self
    }

    /// Lowers the upper bound to `key` (inclusive) when that narrows the range.
    pub fn end_at(mut self, key: Bytes) -> Self {
        let narrower = match &self.end {
            Included(e) => key < *e,
            Excluded(e) => key < *e,
            Unbounded => true,
        };
        if narrower {
            self.end = Included(key);
        }
        self
    }

    /// Moves the lower bound just past `key`, for resuming a forward scan.
    pub fn resume_after(&mut self, key: Bytes) {
        self.start = Excluded(key);
    }

    /// Moves the upper bound just before `key`, for resuming a reverse scan.
    pub fn resume_before(&mut self, key: Bytes) {
        self.end = Excluded(key);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn should_increment_produce_strictly_greater_result(data: Vec<u8>) {
            prop_assume!(data.iter().any(|&b| b != 0xFF));

            let incremented = lex_increment(&data).unwrap();
            prop_assert!(incremented.as_ref() > data.as_slice());
        }

        #[test]
        fn should_prefix_range_contain_exactly_prefixed_keys(prefix: Vec<u8>, other: Vec<u8>) {
            prop_assume!(!prefix.is_empty());

            let range = BytesRange::prefix(Bytes::from(prefix.clone()));

            prop_assert_eq!(range.contains(&other), other.starts_with(&prefix));
        }

        #[test]
        fn should_empty_range_contain_no_key(start: Vec<u8>, end: Vec<u8>, key: Vec<u8>) {
            let range = BytesRange::new(Excluded(Bytes::from(start)), Included(Bytes::from(end)));

            if range.is_empty() {
                prop_assert!(!range.contains(&key));
            }
        }
    }

    #[test]
    fn should_increment_simple_byte() {
        assert_eq!(lex_increment(b"a").unwrap().as_ref(), b"b");
        assert_eq!(lex_increment(b"dir/").unwrap().as_ref(), b"dir0");
    }

    #[test]
    fn should_increment_with_trailing_ff() {
        assert_eq!(lex_increment(&[0x61, 0xFF]).unwrap().as_ref(), &[0x62]);
        assert_eq!(
            lex_increment(&[0x00, 0xFF, 0xFF]).unwrap().as_ref(),
            &[0x01]
        );
    }

    #[test]
    fn should_return_none_for_non_incrementable() {
        assert!(lex_increment(&[]).is_none());
        assert!(lex_increment(&[0xFF, 0xFF]).is_none());
    }

    #[test]
    fn should_create_prefix_range() {
        let range = BytesRange::prefix(Bytes::from("foo"));

        assert!(range.contains(b"foo"));
        assert!(range.contains(b"foo\xFF"));
        assert!(!range.contains(b"fo"));
        assert!(!range.contains(b"fop"));
    }

    #[test]
    fn should_leave_all_ff_prefix_unbounded_above() {
        let range = BytesRange::prefix(Bytes::from_static(&[0xFF, 0xFF]));

        assert_eq!(range.end, Unbounded);
        assert!(range.contains(&[0xFF, 0xFF, 0xFF, 0xFF]));
        assert!(!range.contains(&[0xFE, 0xFF]));
    }

    #[test]
    fn should_detect_empty_ranges() {
        let b = || Bytes::from("b");
        let c = || Bytes::from("c");

        assert!(!BytesRange::unbounded().is_empty());
        assert!(!BytesRange::new(Included(b()), Included(b())).is_empty());
        assert!(BytesRange::new(Included(b()), Excluded(b())).is_empty());
        assert!(BytesRange::new(Excluded(b()), Excluded(b())).is_empty());
        assert!(BytesRange::new(Included(c()), Included(b())).is_empty());
        assert!(BytesRange::new(Unbounded, Excluded(Bytes::new())).is_empty());
        assert!(!BytesRange::new(Excluded(b()), Unbounded).is_empty());
    }

    #[test]
    fn should_only_narrow_when_starting_at_key() {
        let range = BytesRange::prefix(Bytes::from("m"));

        let inside = range.clone().start_at(Bytes::from("m5"));
        let before = range.clone().start_at(Bytes::from("a"));

        assert_eq!(inside.start, Included(Bytes::from("m5")));
        assert_eq!(before.start, Included(Bytes::from("m")));
    }

    #[test]
    fn should_only_narrow_when_ending_at_key() {
        let range = BytesRange::prefix(Bytes::from("m"));

        let inside = range.clone().end_at(Bytes::from("m5"));
        let after = range.clone().end_at(Bytes::from("z"));

        assert_eq!(inside.end, Included(Bytes::from("m5")));
        assert_eq!(after.end, Excluded(Bytes::from("n")));
    }

    #[test]
    fn should_become_empty_when_first_key_precedes_prefix_in_reverse() {
        let range = BytesRange::prefix(Bytes::from("m")).end_at(Bytes::from("a"));

        assert!(range.is_empty());
    }

    #[test]
    fn should_resume_past_last_key() {
        let mut range = BytesRange::unbounded();

        range.resume_after(Bytes::from("k"));
        assert!(!range.contains(b"k"));
        assert!(range.contains(b"k\x00"));

        range.resume_before(Bytes::from("p"));
        assert!(!range.contains(b"p"));
        assert!(range.contains(b"o"));
    }
}
