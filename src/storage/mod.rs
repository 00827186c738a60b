// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Log-structured local storage: append-only segments, point-lookup indices,
//! compaction, and an LSM-tree variant.

pub mod bloom;
pub mod compaction;
pub mod hash_index;
pub mod lsm;
pub mod memtable;
pub mod segment;
pub mod segment_store;
pub mod sparse_index;
pub mod sstable;

use crate::{Config, UserKey, UserValue};
use bloom::BloomFilter;
use hash_index::HashIndex;
use segment::Record;
use segment_store::SegmentStore;
use std::sync::{Arc, Mutex};

/// Engine counters returned by [`StorageEngine::stats`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Stats {
    /// Number of live segments
    pub segments: usize,

    /// Number of live keys
    pub keys: usize,

    /// Total bytes across all segments
    pub total_size: u64,
}

#[doc(hidden)]
pub struct EngineInner {
    config: Config,
    store: SegmentStore,
    index: HashIndex,
    bloom: Mutex<BloomFilter>,

    // Serializes writers so index/bloom updates observe append order
    write_lock: Mutex<()>,

    // At most one merge pass at a time
    compaction_lock: Mutex<()>,

    shutdown: crate::shutdown::Shutdown,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// A log-structured key-value storage engine
///
/// Binds the segmented append log, the in-memory indices and the compactor
/// into a `put`/`get`/`delete` store. Reads go bloom filter → hash index →
/// segment random read; the bloom check is advisory, the index is
/// authoritative.
///
/// The handle is cheap to clone and shareable across threads.
#[derive(Clone)]
pub struct StorageEngine(Arc<EngineInner>);

impl StorageEngine {
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        let store = SegmentStore::open(&config.path, config.segment_max_size)?;

        let index = HashIndex::default();
        index.rebuild(&store)?;

        let mut bloom = BloomFilter::with_size(config.bloom_size, config.bloom_hashes);
        bloom.rebuild(index.keys());

        log::info!(
            "storage engine at {:?} opened with {} key(s) in {} segment(s)",
            config.path,
            index.len(),
            store.segment_count(),
        );

        Ok(Self(Arc::new(EngineInner {
            config,
            store,
            index,
            bloom: Mutex::new(bloom),
            write_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            shutdown: crate::shutdown::Shutdown::default(),
        })))
    }

    /// Writes a key-value pair.
    pub fn put<K: Into<UserKey>, V: Into<UserValue>>(&self, key: K, value: V) -> crate::Result<()> {
        let key = key.into();

        #[allow(clippy::expect_used)]
        let _guard = self.0.write_lock.lock().expect("lock is poisoned");

        let record = Record::new(key.clone(), value.into());
        let location = self.0.store.append(&record)?;

        self.0.index.insert(key.clone(), location);

        #[allow(clippy::expect_used)]
        self.0.bloom.lock().expect("lock is poisoned").add(&key);

        Ok(())
    }

    /// Reads the current value of a key.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<UserValue>> {
        let key = key.as_ref();

        {
            #[allow(clippy::expect_used)]
            let bloom = self.0.bloom.lock().expect("lock is poisoned");

            if !bloom.might_contain(key) {
                return Ok(None);
            }
        }

        let Some((segment_id, offset)) = self.0.index.get(key) else {
            return Ok(None);
        };

        let Some(segment) = self.0.store.segment(segment_id) else {
            // Index briefly trails a concurrent compaction swap
            return Ok(None);
        };

        let record = segment.read_at(offset)?;

        if record.is_tombstone() || &*record.key != key {
            return Ok(None);
        }

        Ok(record.value)
    }

    /// Writes a tombstone for a key and drops it from the index.
    ///
    /// Idempotent: deleting an absent key is a no-op on the index, and the
    /// extra tombstone is consumed by the next compaction.
    pub fn delete<K: Into<UserKey>>(&self, key: K) -> crate::Result<()> {
        let key = key.into();

        #[allow(clippy::expect_used)]
        let _guard = self.0.write_lock.lock().expect("lock is poisoned");

        self.0.store.append(&Record::tombstone(key.clone()))?;
        self.0.index.remove(&key);

        Ok(())
    }

    /// Returns `true` if the key currently has a live value.
    pub fn exists<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<bool> {
        let key = key.as_ref();

        {
            #[allow(clippy::expect_used)]
            let bloom = self.0.bloom.lock().expect("lock is poisoned");

            if !bloom.might_contain(key) {
                return Ok(false);
            }
        }

        Ok(self.0.index.get(key).is_some())
    }

    /// Returns all live keys (unordered).
    #[must_use]
    pub fn keys(&self) -> Vec<UserKey> {
        self.0.index.keys()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.index.len()
    }

    /// Returns `true` if no live keys exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one compaction pass right now.
    pub fn force_compaction(&self) -> crate::Result<()> {
        self.compact_once()?;
        Ok(())
    }

    /// Merges sealed segments once, if enough have amassed.
    ///
    /// After the swap, index entries that referenced replaced segments are
    /// re-pointed at the merged output so reads keep succeeding.
    pub fn compact_once(&self) -> crate::Result<bool> {
        #[allow(clippy::expect_used)]
        let _guard = self.0.compaction_lock.lock().expect("lock is poisoned");

        let Some(result) =
            compaction::compact_segments(&self.0.store, self.0.config.compaction_min_segments)?
        else {
            return Ok(false);
        };

        let Some(new_segment) = self.0.store.segment(result.new_segment_id) else {
            return Ok(false);
        };

        #[allow(clippy::expect_used)]
        let _write_guard = self.0.write_lock.lock().expect("lock is poisoned");

        for item in new_segment.iter()? {
            let (offset, record) = item?;

            let points_at_replaced = self
                .0
                .index
                .get(&record.key)
                .is_some_and(|(id, _)| result.replaced_ids.contains(&id));

            if points_at_replaced {
                self.0
                    .index
                    .insert(record.key, (result.new_segment_id, offset));
            }
        }

        Ok(true)
    }

    /// Spawns the background compactor; it stops when the engine is dropped.
    pub fn start_background_compaction(&self) {
        let weak = Arc::downgrade(&self.0);
        let shutdown = self.0.shutdown.clone();
        let interval = self.0.config.compaction_interval;

        std::thread::spawn(move || {
            compaction::run_worker(interval, &shutdown, || {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };

                if let Err(e) = Self(inner).compact_once() {
                    log::error!("background compaction failed: {e}");
                }

                true
            });

            log::trace!("background compactor exiting");
        });
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        Stats {
            segments: self.0.store.segment_count(),
            keys: self.0.index.len(),
            total_size: self.0.store.total_size(),
        }
    }
}
