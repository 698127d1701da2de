//! Key selectors and range boundaries.
//!
//! A selector names a key relative to a reference key: take the last key that
//! is `< key` (or `<= key` when `or_equal` is set), then move `offset` keys
//! forward. The four factories below cover every boundary the iterator needs.

use std::fmt;

/// Immutable reference to a position in the ordered keyspace.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeySelector {
    key: Vec<u8>,
    or_equal: bool,
    offset: i32,
}

impl KeySelector {
    pub fn new(key: impl Into<Vec<u8>>, or_equal: bool, offset: i32) -> Self {
        Self {
            key: key.into(),
            or_equal,
            offset,
        }
    }

    /// The first key `>= key`.
    pub fn first_greater_or_equal(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, false, 1)
    }

    /// The first key `> key`.
    pub fn first_greater_than(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, true, 1)
    }

    /// The last key `< key`.
    pub fn last_less_than(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, false, 0)
    }

    /// The last key `<= key`.
    pub fn last_less_or_equal(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, true, 0)
    }

    /// Returns a selector `offset` keys further along than this one.
    pub fn add(&self, offset: i32) -> Self {
        Self::new(self.key.clone(), self.or_equal, self.offset.saturating_add(offset))
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn or_equal(&self) -> bool {
        self.or_equal
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Resolves this selector to an index into `keys`, which must be sorted.
    ///
    /// The result is clamped to `[0, keys.len()]`, where `keys.len()` means
    /// "past the last key".
    pub fn resolve<K: AsRef<[u8]>>(&self, keys: &[K]) -> usize {
        let key = self.key.as_slice();
        let base = if self.or_equal {
            keys.partition_point(|k| k.as_ref() <= key)
        } else {
            keys.partition_point(|k| k.as_ref() < key)
        };
        let idx = base as i64 - 1 + i64::from(self.offset);
        idx.clamp(0, keys.len() as i64) as usize
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KeySelector({}, {}, {})",
            printable(&self.key),
            self.or_equal,
            self.offset
        )
    }
}

/// Derives the cursor boundaries for the next fetch after a chunk whose last
/// key was `last_key`.
///
/// Ascending scans move `begin` strictly past the last key; descending scans
/// pull `end` down onto it (the end is exclusive), so the boundary key is
/// never read twice.
pub fn continuation_selectors(
    begin: &KeySelector,
    end: &KeySelector,
    last_key: &[u8],
    reverse: bool,
) -> (KeySelector, KeySelector) {
    if reverse {
        (begin.clone(), KeySelector::first_greater_or_equal(last_key))
    } else {
        (KeySelector::first_greater_than(last_key), end.clone())
    }
}

/// A half-open `[begin, end)` range over raw keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// Every key that starts with `prefix`.
    pub fn starts_with(prefix: &[u8]) -> Self {
        Self {
            begin: prefix.to_vec(),
            end: strinc(prefix),
        }
    }

    pub fn selectors(&self) -> (KeySelector, KeySelector) {
        (
            KeySelector::first_greater_or_equal(self.begin.clone()),
            KeySelector::first_greater_or_equal(self.end.clone()),
        )
    }
}

/// Smallest key greater than every key prefixed by `prefix`.
fn strinc(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last().copied() {
        if last == 0xff {
            out.pop();
            continue;
        }
        if let Some(slot) = out.last_mut() {
            *slot = last + 1;
        }
        return out;
    }
    // All-0xff (or empty) prefixes extend to the end of the user keyspace.
    vec![0xff]
}

/// Renders a key for logs: printable ASCII as-is, everything else as `\xNN`.
pub(crate) fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key {
        if byte.is_ascii_graphic() || *byte == b' ' {
            out.push(*byte as char);
        } else {
            out.push_str(&format!("\\x{byte:02x}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<Vec<u8>> {
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    }

    #[test]
    fn factories_resolve_to_expected_positions() {
        let keys = keys();
        assert_eq!(KeySelector::first_greater_or_equal(b"b".to_vec()).resolve(&keys), 1);
        assert_eq!(KeySelector::first_greater_than(b"b".to_vec()).resolve(&keys), 2);
        assert_eq!(KeySelector::last_less_than(b"b".to_vec()).resolve(&keys), 0);
        assert_eq!(KeySelector::last_less_or_equal(b"b".to_vec()).resolve(&keys), 1);
        // Missing reference keys land between neighbours.
        assert_eq!(KeySelector::first_greater_or_equal(b"bb".to_vec()).resolve(&keys), 2);
        assert_eq!(KeySelector::first_greater_than(b"bb".to_vec()).resolve(&keys), 2);
    }

    #[test]
    fn resolve_clamps_offsets_to_keyspace() {
        let keys = keys();
        assert_eq!(KeySelector::first_greater_or_equal(b"a".to_vec()).add(10).resolve(&keys), 4);
        assert_eq!(KeySelector::last_less_than(b"a".to_vec()).add(-3).resolve(&keys), 0);
        assert_eq!(KeySelector::first_greater_or_equal(b"e".to_vec()).resolve(&keys), 4);
    }

    #[test]
    fn forward_continuation_skips_last_key() {
        let begin = KeySelector::first_greater_or_equal(b"a".to_vec());
        let end = KeySelector::first_greater_or_equal(b"e".to_vec());
        let (next_begin, next_end) = continuation_selectors(&begin, &end, b"b", false);
        assert_eq!(next_begin, KeySelector::first_greater_than(b"b".to_vec()));
        assert_eq!(next_end, end);
        assert_eq!(next_begin.resolve(&keys()), 2);
    }

    #[test]
    fn reverse_continuation_excludes_last_key() {
        let begin = KeySelector::first_greater_or_equal(b"a".to_vec());
        let end = KeySelector::first_greater_or_equal(b"e".to_vec());
        let (next_begin, next_end) = continuation_selectors(&begin, &end, b"c", true);
        assert_eq!(next_begin, begin);
        assert_eq!(next_end, KeySelector::first_greater_or_equal(b"c".to_vec()));
        // End is exclusive, so `c` is no longer in range.
        assert_eq!(next_end.resolve(&keys()), 2);
    }

    #[test]
    fn starts_with_increments_last_non_ff_byte() {
        assert_eq!(KeyRange::starts_with(b"ab").end, b"ac".to_vec());
        assert_eq!(KeyRange::starts_with(b"a\xff\xff").end, b"b".to_vec());
        assert_eq!(KeyRange::starts_with(b"\xff").end, vec![0xff]);
        assert_eq!(KeyRange::starts_with(b"").end, vec![0xff]);
    }

    #[test]
    fn printable_escapes_binary_bytes() {
        assert_eq!(printable(b"k\x00\xff"), "k\\x00\\xff");
    }
}
