// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::Arc;

/// An immutable, cheaply cloneable byte slice
///
/// Keys and values flow through every layer of the crate (segments, version
/// chains, replicated commands), so they are reference-counted once and
/// shared instead of copied. Ordering and hashing match `[u8]`, which lets
/// maps and skiplists keyed by [`Slice`] be probed with plain byte slices.
#[derive(Clone, Hash, PartialEq, Eq, Ord, PartialOrd)]
pub struct Slice(Arc<[u8]>);

impl Slice {
    /// Copies a byte slice into a new [`Slice`].
    #[must_use]
    pub fn new(bytes: &[u8]) -> Self {
        Self::from(bytes)
    }

    /// The zero-length slice.
    #[must_use]
    pub fn empty() -> Self {
        Self::from(Vec::new())
    }

    /// Copies the contents out into a fresh `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for the zero-length slice.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Keys are usually readable text; render them as such, escaping the rest
impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl std::ops::Deref for Slice {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Slice {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::borrow::Borrow<[u8]> for Slice {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Slice {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<Vec<u8>> for Slice {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice().into())
    }
}

impl From<&str> for Slice {
    fn from(text: &str) -> Self {
        text.as_bytes().into()
    }
}

impl From<String> for Slice {
    fn from(text: String) -> Self {
        text.into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::Slice;
    use test_log::test;

    #[test]
    fn slice_orders_like_bytes() {
        let mut keys = vec![
            Slice::from("key_10"),
            Slice::from("key_02"),
            Slice::from("key_1"),
        ];
        keys.sort();

        assert_eq!(
            vec![
                Slice::from("key_02"),
                Slice::from("key_1"),
                Slice::from("key_10"),
            ],
            keys,
        );
    }

    #[test]
    fn slice_empty() {
        let empty = Slice::empty();
        assert!(empty.is_empty());
        assert_eq!(0, empty.len());
        assert_eq!(empty, Slice::from(""));
    }

    #[test]
    fn slice_clone_shares_storage() {
        let a = Slice::from("shared");
        let b = a.clone();

        assert_eq!(a, b);
        assert!(std::ptr::eq(&*a, &*b));
    }

    #[test]
    fn slice_probes_maps_by_bytes() {
        use std::collections::HashMap;

        let mut map: HashMap<Slice, u64> = HashMap::new();
        map.insert("k".into(), 5);

        // Borrow<[u8]> + matching Hash means no allocation per lookup
        assert_eq!(Some(&5), map.get(b"k".as_slice()));
        assert_eq!(None, map.get(b"other".as_slice()));
    }

    #[test]
    fn slice_debug_is_lossy_text() {
        assert_eq!("\"abc\"", format!("{:?}", Slice::from("abc")));
    }
}
