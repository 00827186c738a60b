// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::storage::{lsm::LsmTree, StorageEngine};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Storage configuration, opened into a [`StorageEngine`] or [`LsmTree`]
///
/// # Example usage
///
/// ```
/// use skerry::Config;
/// #
/// # let folder = tempfile::tempdir()?;
///
/// let engine = Config::new(folder)
///     .segment_max_size(/* 4 MiB */ 4 * 1_024 * 1_024)
///     .open()?;
/// #
/// # Ok::<(), skerry::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Folder the data lives in
    pub(crate) path: PathBuf,

    /// Seal threshold of the active segment in bytes
    pub(crate) segment_max_size: u64,

    /// Cadence of the background compactor
    pub(crate) compaction_interval: Duration,

    /// Minimum sealed segments before a merge pass runs
    pub(crate) compaction_min_segments: usize,

    /// Bloom filter bit count
    pub(crate) bloom_size: usize,

    /// Bloom filter hash function count
    pub(crate) bloom_hashes: usize,

    /// LSM flush threshold in records
    pub(crate) memtable_size: usize,

    /// Sample every Nth record into sparse/SSTable indexes
    pub(crate) sparse_interval: usize,
}

impl Config {
    /// Creates a config for the given folder with default settings.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            segment_max_size: /* 1 MiB */ 1_024 * 1_024,
            compaction_interval: Duration::from_secs(30),
            compaction_min_segments: 2,
            bloom_size: 100_000,
            bloom_hashes: 4,
            memtable_size: 1_000,
            sparse_interval: 100,
        }
    }

    /// Sets the seal threshold of the active segment.
    ///
    /// Defaults to 1 MiB.
    #[must_use]
    pub fn segment_max_size(mut self, bytes: u64) -> Self {
        self.segment_max_size = bytes;
        self
    }

    /// Sets the cadence of the background compactor.
    ///
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Sets how many sealed segments must exist before a merge pass runs.
    ///
    /// Clamped to at least 2. Defaults to 2.
    #[must_use]
    pub fn compaction_min_segments(mut self, n: usize) -> Self {
        self.compaction_min_segments = n.max(2);
        self
    }

    /// Sets the bloom filter size in bits.
    ///
    /// Defaults to 100 000.
    #[must_use]
    pub fn bloom_size(mut self, bits: usize) -> Self {
        self.bloom_size = bits;
        self
    }

    /// Sets the number of bloom filter hash functions.
    ///
    /// Defaults to 4.
    #[must_use]
    pub fn bloom_hashes(mut self, hashes: usize) -> Self {
        self.bloom_hashes = hashes;
        self
    }

    /// Sets the LSM memtable flush threshold in records.
    ///
    /// Defaults to 1000.
    #[must_use]
    pub fn memtable_size(mut self, records: usize) -> Self {
        self.memtable_size = records;
        self
    }

    /// Sets the sparse index sampling interval.
    ///
    /// Defaults to every 100th record.
    #[must_use]
    pub fn sparse_interval(mut self, interval: usize) -> Self {
        self.sparse_interval = interval.max(1);
        self
    }

    /// Opens the segmented storage engine.
    pub fn open(self) -> crate::Result<StorageEngine> {
        StorageEngine::open(self)
    }

    /// Opens the LSM-tree variant in the same folder.
    pub fn open_lsm(self) -> crate::Result<LsmTree> {
        LsmTree::open(self.path, self.memtable_size, self.sparse_interval)
    }
}
