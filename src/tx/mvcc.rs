// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    oracle::{Timestamp, TimestampOracle, TxnId, TxnIdCounter},
    IsolationLevel,
};
use crate::{Error, UserKey, UserValue};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

/// One committed version of a key
#[derive(Clone, Debug)]
pub struct Version {
    /// Committed value; `None` marks a deletion
    pub value: Option<UserValue>,

    /// Transaction that wrote this version
    pub txn_id: TxnId,

    /// Commit timestamp; versions of a key are ordered by it
    pub commit_ts: Timestamp,
}

#[derive(Default)]
struct KeyRecord {
    /// Committed versions, ascending by commit timestamp
    versions: Vec<Version>,

    /// Holder of the (single) write lock, if any
    lock_holder: Option<TxnId>,
}

struct TxnState {
    start_ts: Timestamp,
    read_set: FxHashSet<UserKey>,
    write_set: FxHashMap<UserKey, Option<UserValue>>,
}

#[derive(Default)]
struct MvccInner {
    data: FxHashMap<UserKey, KeyRecord>,
    active: FxHashMap<TxnId, TxnState>,
}

/// Multi-version concurrency control store
///
/// Each key owns an ordered list of committed versions; writers take a
/// per-key write lock and buffer pending versions in their write set until
/// commit, so readers never block.
///
/// The configured [`IsolationLevel`] decides what a read observes:
/// `Snapshot` (the default) resolves against the transaction's start
/// timestamp, `ReadCommitted` always sees the newest committed version,
/// `ReadUncommitted` ignores the snapshot entirely. `Serializable` keeps
/// snapshot semantics here and layers conflict tracking on top (see
/// [`super::ssi::SerializableStore`]).
pub struct MvccStore {
    isolation: IsolationLevel,
    ids: TxnIdCounter,
    clock: TimestampOracle,
    inner: Mutex<MvccInner>,
}

impl Default for MvccStore {
    fn default() -> Self {
        Self::new(IsolationLevel::Snapshot)
    }
}

impl MvccStore {
    /// Creates an empty store with the given isolation level.
    #[must_use]
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            ids: TxnIdCounter::default(),
            clock: TimestampOracle::default(),
            inner: Mutex::new(MvccInner::default()),
        }
    }

    /// Begins a transaction, returning its id and start timestamp.
    pub fn begin(&self) -> (TxnId, Timestamp) {
        let txn_id = self.ids.next();
        let start_ts = self.clock.now();

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        inner.active.insert(
            txn_id,
            TxnState {
                start_ts,
                read_set: FxHashSet::default(),
                write_set: FxHashMap::default(),
            },
        );

        (txn_id, start_ts)
    }

    /// Reads a key as the transaction observes it.
    ///
    /// Own pending writes are visible; otherwise visibility follows the
    /// isolation level. A visible deletion marker reads as `None`.
    pub fn read(&self, txn_id: TxnId, key: &[u8]) -> crate::Result<Option<UserValue>> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *inner;

        let txn = inner.active.get_mut(&txn_id).ok_or(Error::TransactionEnded)?;

        if self.isolation == IsolationLevel::ReadUncommitted {
            // No snapshot, no own-write lookup: newest version wins
            return Ok(inner
                .data
                .get(key)
                .and_then(|record| record.versions.last())
                .and_then(|version| version.value.clone()));
        }

        if let Some(pending) = txn.write_set.get(key) {
            return Ok(pending.clone());
        }

        txn.read_set.insert(key.into());

        let Some(record) = inner.data.get(key) else {
            return Ok(None);
        };

        let visible = match self.isolation {
            IsolationLevel::ReadCommitted => record.versions.last(),
            _ => {
                let start_ts = txn.start_ts;
                let idx = record.versions.partition_point(|v| v.commit_ts <= start_ts);
                idx.checked_sub(1).and_then(|i| record.versions.get(i))
            }
        };

        Ok(visible.and_then(|version| version.value.clone()))
    }

    /// Buffers a pending write, taking the key's write lock.
    pub fn write<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        txn_id: TxnId,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        self.put_pending(txn_id, key.into(), Some(value.into()))
    }

    /// Buffers a pending deletion, taking the key's write lock.
    pub fn delete<K: Into<UserKey>>(&self, txn_id: TxnId, key: K) -> crate::Result<()> {
        self.put_pending(txn_id, key.into(), None)
    }

    fn put_pending(
        &self,
        txn_id: TxnId,
        key: UserKey,
        value: Option<UserValue>,
    ) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *inner;

        if !inner.active.contains_key(&txn_id) {
            return Err(Error::TransactionEnded);
        }

        let record = inner.data.entry(key.clone()).or_default();

        match record.lock_holder {
            // A holder that is no longer active left a stale lock behind
            Some(holder) if holder != txn_id && inner.active.contains_key(&holder) => {
                return Err(Error::WriteConflict);
            }
            _ => record.lock_holder = Some(txn_id),
        }

        #[allow(clippy::expect_used)]
        let txn = inner.active.get_mut(&txn_id).expect("checked above");
        txn.write_set.insert(key, value);

        Ok(())
    }

    /// Commits: pending versions enter the version lists, locks release.
    pub fn commit(&self, txn_id: TxnId) -> crate::Result<Timestamp> {
        let commit_ts = self.clock.now();

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *inner;

        let txn = inner.active.remove(&txn_id).ok_or(Error::TransactionEnded)?;

        for (key, value) in txn.write_set {
            let record = inner.data.entry(key).or_default();

            record.versions.push(Version {
                value,
                txn_id,
                commit_ts,
            });

            if record.lock_holder == Some(txn_id) {
                record.lock_holder = None;
            }
        }

        Ok(commit_ts)
    }

    /// Aborts: pending versions vanish, locks release.
    ///
    /// Idempotent; aborting an already-ended transaction is a no-op.
    pub fn abort(&self, txn_id: TxnId) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *inner;

        let Some(txn) = inner.active.remove(&txn_id) else {
            return;
        };

        for key in txn.write_set.keys() {
            if let Some(record) = inner.data.get_mut(&**key) {
                if record.lock_holder == Some(txn_id) {
                    record.lock_holder = None;
                }
            }
        }
    }

    /// Smallest start timestamp among live transactions, if any.
    pub fn min_active_start_ts(&self) -> Option<Timestamp> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.active.values().map(|t| t.start_ts).min()
    }

    /// Garbage-collects versions no live snapshot can observe.
    ///
    /// A version is dropped once a newer committed version exists and no
    /// active transaction started before that newer version committed. The
    /// latest version of every key is always retained.
    ///
    /// Returns the number of dropped versions.
    pub fn gc(&self) -> usize {
        let horizon = self.min_active_start_ts().unwrap_or_else(|| self.clock.now());

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let mut dropped = 0;

        for record in inner.data.values_mut() {
            let visible_idx = record
                .versions
                .partition_point(|v| v.commit_ts <= horizon)
                .saturating_sub(1);

            if visible_idx > 0 {
                record.versions.drain(0..visible_idx);
                dropped += visible_idx;
            }
        }

        dropped
    }

    /// Number of stored versions for a key (diagnostics).
    pub fn version_count(&self, key: &[u8]) -> usize {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.data.get(key).map_or(0, |r| r.versions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mvcc_snapshot_read_ignores_later_commits() -> crate::Result<()> {
        let store = MvccStore::default();

        let (setup, _) = store.begin();
        store.write(setup, "k", "v1")?;
        store.commit(setup)?;

        let (reader, _) = store.begin();
        let (writer, _) = store.begin();

        store.write(writer, "k", "v2")?;
        store.commit(writer)?;

        // Reader's snapshot predates the second commit
        assert_eq!(Some("v1".into()), store.read(reader, b"k")?);

        let (late, _) = store.begin();
        assert_eq!(Some("v2".into()), store.read(late, b"k")?);

        Ok(())
    }

    #[test]
    fn mvcc_own_writes_visible() -> crate::Result<()> {
        let store = MvccStore::default();

        let (txn, _) = store.begin();
        assert_eq!(None, store.read(txn, b"k")?);

        store.write(txn, "k", "mine")?;
        assert_eq!(Some("mine".into()), store.read(txn, b"k")?);

        store.delete(txn, "k")?;
        assert_eq!(None, store.read(txn, b"k")?);

        Ok(())
    }

    #[test]
    fn mvcc_write_conflict() -> crate::Result<()> {
        let store = MvccStore::default();

        let (t1, _) = store.begin();
        let (t2, _) = store.begin();

        store.write(t1, "k", "a")?;

        assert!(matches!(
            store.write(t2, "k", "b"),
            Err(Error::WriteConflict)
        ));

        // Abort releases the lock
        store.abort(t1);
        store.write(t2, "k", "b")?;
        store.commit(t2)?;

        let (check, _) = store.begin();
        assert_eq!(Some("b".into()), store.read(check, b"k")?);

        Ok(())
    }

    #[test]
    fn mvcc_abort_discards_pending() -> crate::Result<()> {
        let store = MvccStore::default();

        let (setup, _) = store.begin();
        store.write(setup, "k", "kept")?;
        store.commit(setup)?;

        let (txn, _) = store.begin();
        store.write(txn, "k", "discarded")?;
        store.abort(txn);

        // Idempotent
        store.abort(txn);

        let (check, _) = store.begin();
        assert_eq!(Some("kept".into()), store.read(check, b"k")?);

        Ok(())
    }

    #[test]
    fn mvcc_ended_transaction_errors() -> crate::Result<()> {
        let store = MvccStore::default();

        let (txn, _) = store.begin();
        store.commit(txn)?;

        assert!(matches!(store.read(txn, b"k"), Err(Error::TransactionEnded)));
        assert!(matches!(
            store.write(txn, "k", "v"),
            Err(Error::TransactionEnded)
        ));
        assert!(matches!(store.commit(txn), Err(Error::TransactionEnded)));

        Ok(())
    }

    #[test]
    fn mvcc_deleted_marker_reads_as_absent() -> crate::Result<()> {
        let store = MvccStore::default();

        let (setup, _) = store.begin();
        store.write(setup, "k", "v")?;
        store.commit(setup)?;

        let (deleter, _) = store.begin();
        store.delete(deleter, "k")?;
        store.commit(deleter)?;

        let (check, _) = store.begin();
        assert_eq!(None, store.read(check, b"k")?);

        Ok(())
    }

    #[test]
    fn mvcc_read_committed_sees_fresh_commits() -> crate::Result<()> {
        let store = MvccStore::new(IsolationLevel::ReadCommitted);

        let (setup, _) = store.begin();
        store.write(setup, "k", "v1")?;
        store.commit(setup)?;

        let (reader, _) = store.begin();
        assert_eq!(Some("v1".into()), store.read(reader, b"k")?);

        let (writer, _) = store.begin();
        store.write(writer, "k", "v2")?;
        store.commit(writer)?;

        // Same transaction, new read, new value: no snapshot
        assert_eq!(Some("v2".into()), store.read(reader, b"k")?);

        Ok(())
    }

    #[test]
    fn mvcc_gc_retains_visible_versions() -> crate::Result<()> {
        let store = MvccStore::default();

        for value in ["v1", "v2", "v3"] {
            let (txn, _) = store.begin();
            store.write(txn, "k", value)?;
            store.commit(txn)?;
        }

        assert_eq!(3, store.version_count(b"k"));

        // A live snapshot from before GC pins nothing older than v3
        let (reader, _) = store.begin();

        let dropped = store.gc();
        assert_eq!(2, dropped);
        assert_eq!(1, store.version_count(b"k"));

        assert_eq!(Some("v3".into()), store.read(reader, b"k")?);

        Ok(())
    }
}
