// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{segment::SegmentId, segment_store::SegmentStore};
use crate::UserKey;
use std::sync::RwLock;

/// One sampled entry of a [`SparseIndex`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SparseEntry {
    /// Sampled key
    pub key: UserKey,

    /// Segment the key lives in
    pub segment_id: SegmentId,

    /// Record offset inside the segment
    pub offset: u64,
}

/// Sorted every-Nth-record index bounding scan windows
///
/// `find_range(k)` returns the greatest sampled entry ≤ k and the next
/// sampled entry; the record for `k`, if it exists, lies between them.
pub struct SparseIndex {
    entries: RwLock<Vec<SparseEntry>>,
    interval: usize,
}

impl SparseIndex {
    /// Creates an empty sparse index sampling every `interval`-th record.
    #[must_use]
    pub fn new(interval: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            interval: interval.max(1),
        }
    }

    /// Inserts (or replaces) a sampled entry, keeping entries sorted by key.
    pub fn add(&self, key: UserKey, segment_id: SegmentId, offset: u64) {
        #[allow(clippy::expect_used)]
        let mut entries = self.entries.write().expect("lock is poisoned");

        let idx = entries.partition_point(|e| e.key < key);

        let entry = SparseEntry {
            key,
            segment_id,
            offset,
        };

        match entries.get_mut(idx) {
            Some(existing) if existing.key == entry.key => *existing = entry,
            _ => entries.insert(idx, entry),
        }
    }

    /// Returns the sampled window `(lower, upper)` around `key`.
    ///
    /// `lower` is the greatest entry with `entry.key <= key` (None if `key`
    /// precedes all samples); `upper` is the first entry after the window.
    pub fn find_range(&self, key: &[u8]) -> (Option<SparseEntry>, Option<SparseEntry>) {
        #[allow(clippy::expect_used)]
        let entries = self.entries.read().expect("lock is poisoned");

        if entries.is_empty() {
            return (None, None);
        }

        let idx = entries.partition_point(|e| &*e.key <= key);

        if idx == 0 {
            return (None, entries.first().cloned());
        }

        (entries.get(idx - 1).cloned(), entries.get(idx).cloned())
    }

    /// Number of sampled entries.
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let entries = self.entries.read().expect("lock is poisoned");
        entries.len()
    }

    /// Returns `true` if nothing has been sampled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuilds by scanning every segment, sampling every Nth live record.
    pub fn rebuild(&self, store: &SegmentStore) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut entries = self.entries.write().expect("lock is poisoned");

        entries.clear();

        let mut count = 0usize;

        for segment in store.segments() {
            for item in segment.iter()? {
                let (offset, record) = item?;

                if !record.is_tombstone() && count % self.interval == 0 {
                    entries.push(SparseEntry {
                        key: record.key,
                        segment_id: segment.id,
                        offset,
                    });
                }

                count += 1;
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn sparse_index_window() {
        let index = SparseIndex::new(1);

        index.add("b".into(), 0, 0);
        index.add("f".into(), 0, 40);
        index.add("m".into(), 1, 0);

        // Key before all samples
        let (lo, hi) = index.find_range(b"a");
        assert_eq!(None, lo);
        assert_eq!(Some("b".into()), hi.map(|e| e.key));

        // Exact hit
        let (lo, hi) = index.find_range(b"f");
        assert_eq!(Some("f".into()), lo.clone().map(|e| e.key));
        assert_eq!(Some("m".into()), hi.map(|e| e.key));
        assert_eq!(Some(40), lo.map(|e| e.offset));

        // Between samples
        let (lo, hi) = index.find_range(b"g");
        assert_eq!(Some("f".into()), lo.map(|e| e.key));
        assert_eq!(Some("m".into()), hi.map(|e| e.key));

        // Past the last sample
        let (lo, hi) = index.find_range(b"z");
        assert_eq!(Some("m".into()), lo.map(|e| e.key));
        assert_eq!(None, hi);
    }

    #[test]
    fn sparse_index_replaces_same_key() {
        let index = SparseIndex::new(1);

        index.add("k".into(), 0, 0);
        index.add("k".into(), 2, 99);

        assert_eq!(1, index.len());

        let (lo, _) = index.find_range(b"k");
        assert_eq!(Some((2, 99)), lo.map(|e| (e.segment_id, e.offset)));
    }

    #[test]
    fn sparse_index_rebuild_samples_interval() -> crate::Result<()> {
        use crate::storage::{segment::Record, segment_store::SegmentStore};

        let dir = tempfile::tempdir()?;
        let store = SegmentStore::open(dir.path(), 1024 * 1024)?;

        for i in 0..100u32 {
            store.append(&Record::new(format!("key_{i:04}"), "v"))?;
        }

        let index = SparseIndex::new(10);
        index.rebuild(&store)?;

        assert_eq!(10, index.len());

        Ok(())
    }
}
