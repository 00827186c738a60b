// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{UserKey, UserValue};
use crossbeam_skiplist::SkipMap;
use std::{
    ops::RangeBounds,
    sync::atomic::{AtomicU64, Ordering},
};

/// Intermediary, ephemeral, sorted in-memory storage for new items
///
/// Once the memtable exceeds the record threshold it is sealed and flushed
/// into an SSTable. A `None` value is a tombstone.
pub struct Memtable {
    /// The actual content, stored in a lock-free skiplist.
    items: SkipMap<UserKey, Option<UserValue>>,

    /// Approximate memtable size in bytes.
    approximate_size: AtomicU64,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    /// Creates an empty memtable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: SkipMap::new(),
            approximate_size: AtomicU64::new(0),
        }
    }

    /// Inserts an item (or tombstone) into the memtable.
    pub fn insert(&self, key: UserKey, value: Option<UserValue>) {
        let item_size =
            (key.len() + value.as_ref().map_or(0, |v| v.len()) + std::mem::size_of::<UserKey>())
                as u64;

        self.approximate_size.fetch_add(item_size, Ordering::AcqRel);
        self.items.insert(key, value);
    }

    /// Returns the entry for a key.
    ///
    /// The outer `Option` distinguishes "not present" from a tombstone
    /// (`Some(None)`).
    pub fn get(&self, key: &[u8]) -> Option<Option<UserValue>> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    /// Number of entries (tombstones included).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the memtable holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Gets approximate size of the memtable in bytes.
    pub fn size(&self) -> u64 {
        self.approximate_size.load(Ordering::Acquire)
    }

    /// Iterates all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (UserKey, Option<UserValue>)> + '_ {
        self.items
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// Iterates entries within a key range.
    pub fn range<'a, R: RangeBounds<[u8]> + 'a>(
        &'a self,
        range: R,
    ) -> impl Iterator<Item = (UserKey, Option<UserValue>)> + 'a {
        self.items
            .range(range)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn memtable_get() {
        let memtable = Memtable::new();

        memtable.insert("abc".into(), Some("xyz".into()));

        assert_eq!(Some(Some("xyz".into())), memtable.get(b"abc"));
        assert_eq!(None, memtable.get(b"ab"));
        assert_eq!(None, memtable.get(b"abcd"));
    }

    #[test]
    fn memtable_overwrite() {
        let memtable = Memtable::new();

        memtable.insert("abc".into(), Some("old".into()));
        memtable.insert("abc".into(), Some("new".into()));

        assert_eq!(Some(Some("new".into())), memtable.get(b"abc"));
        assert_eq!(1, memtable.len());
    }

    #[test]
    fn memtable_tombstone() {
        let memtable = Memtable::new();

        memtable.insert("abc".into(), Some("xyz".into()));
        memtable.insert("abc".into(), None);

        assert_eq!(Some(None), memtable.get(b"abc"));
    }

    #[test]
    fn memtable_sorted_iter() {
        let memtable = Memtable::new();

        memtable.insert("b".into(), Some("2".into()));
        memtable.insert("a".into(), Some("1".into()));
        memtable.insert("c".into(), Some("3".into()));

        let keys = memtable.iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(
            vec![UserKey::from("a"), UserKey::from("b"), UserKey::from("c")],
            keys,
        );

        let ranged = memtable
            .range((
                std::ops::Bound::Included("a".as_bytes()),
                std::ops::Bound::Excluded("c".as_bytes()),
            ))
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        assert_eq!(vec![UserKey::from("a"), UserKey::from("b")], ranged);
    }

    #[test]
    fn memtable_size_grows() {
        let memtable = Memtable::new();
        assert_eq!(0, memtable.size());

        memtable.insert("abc".into(), Some("xyz".into()));
        assert!(memtable.size() > 0);
    }
}
