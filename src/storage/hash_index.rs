// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{segment::SegmentId, segment_store::SegmentStore};
use crate::UserKey;
use rustc_hash::FxHashMap;
use std::sync::RwLock;

/// Location of a record inside the segment store
pub type RecordLocation = (SegmentId, u64);

/// In-memory point-lookup index: key → (segment, offset)
///
/// Authoritative for point lookups; for any key it points at the most recent
/// live record, or holds no entry (tombstoned / never written).
#[derive(Default)]
pub struct HashIndex {
    map: RwLock<FxHashMap<UserKey, RecordLocation>>,
}

impl HashIndex {
    /// Looks up the location of a key.
    pub fn get(&self, key: &[u8]) -> Option<RecordLocation> {
        #[allow(clippy::expect_used)]
        let map = self.map.read().expect("lock is poisoned");
        map.get(key).copied()
    }

    /// Points a key at a new location.
    pub fn insert(&self, key: UserKey, location: RecordLocation) {
        #[allow(clippy::expect_used)]
        let mut map = self.map.write().expect("lock is poisoned");
        map.insert(key, location);
    }

    /// Drops the entry for a key.
    pub fn remove(&self, key: &[u8]) {
        #[allow(clippy::expect_used)]
        let mut map = self.map.write().expect("lock is poisoned");
        map.remove(key);
    }

    /// Returns all indexed keys.
    pub fn keys(&self) -> Vec<UserKey> {
        #[allow(clippy::expect_used)]
        let map = self.map.read().expect("lock is poisoned");
        map.keys().cloned().collect()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let map = self.map.read().expect("lock is poisoned");
        map.len()
    }

    /// Returns `true` if no key is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuilds the index by a full scan of all segments, oldest first.
    ///
    /// Later records overwrite earlier ones; tombstones remove entries.
    pub fn rebuild(&self, store: &SegmentStore) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut map = self.map.write().expect("lock is poisoned");

        map.clear();

        for segment in store.segments() {
            for item in segment.iter()? {
                let (offset, record) = item?;

                if record.is_tombstone() {
                    map.remove(&record.key);
                } else {
                    map.insert(record.key, (segment.id, offset));
                }
            }
        }

        Ok(())
    }
}
