// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    mvcc::MvccStore,
    oracle::{Timestamp, TxnId},
    IsolationLevel,
};
use crate::{Error, UserKey, UserValue};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

struct SsiTxn {
    start_ts: Timestamp,
    commit_ts: Option<Timestamp>,
    status: TxnStatus,
    read_set: FxHashSet<UserKey>,
    write_set: FxHashSet<UserKey>,

    /// Incoming rw-antidependency edges
    in_conflict: FxHashSet<TxnId>,

    /// Outgoing rw-antidependency edges
    out_conflict: FxHashSet<TxnId>,
}

#[derive(Default)]
struct SsiInner {
    txns: FxHashMap<TxnId, SsiTxn>,
    siread_locks: FxHashMap<UserKey, FxHashSet<TxnId>>,
    write_locks: FxHashMap<UserKey, TxnId>,
}

/// Serializable Snapshot Isolation on top of the MVCC store
///
/// Implements the Cahill–Fekete–Röhm algorithm: every read places a SIREAD
/// lock, every read/write overlap records an rw-antidependency edge, and a
/// transaction with both an incoming and an outgoing edge whose endpoints
/// are still relevant (live, or committed after the transaction's snapshot)
/// is a *pivot*: committing it could close a cycle, so it aborts with a
/// serialization failure instead.
///
/// SIREAD locks outlive commit: they are swept only once no live
/// transaction's snapshot overlaps the committed reader.
pub struct SerializableStore {
    store: MvccStore,
    inner: Mutex<SsiInner>,
}

impl Default for SerializableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializableStore {
    /// Creates an empty serializable store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: MvccStore::new(IsolationLevel::Snapshot),
            inner: Mutex::new(SsiInner::default()),
        }
    }

    /// Begins a transaction.
    pub fn begin(&self) -> (TxnId, Timestamp) {
        let (txn_id, start_ts) = self.store.begin();

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        inner.txns.insert(
            txn_id,
            SsiTxn {
                start_ts,
                commit_ts: None,
                status: TxnStatus::Active,
                read_set: FxHashSet::default(),
                write_set: FxHashSet::default(),
                in_conflict: FxHashSet::default(),
                out_conflict: FxHashSet::default(),
            },
        );

        (txn_id, start_ts)
    }

    /// Snapshot read that also places a SIREAD lock and records an
    /// rw-antidependency against a concurrent writer of the key.
    pub fn read(&self, txn_id: TxnId, key: &[u8]) -> crate::Result<Option<UserValue>> {
        {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("lock is poisoned");
            let inner = &mut *inner;

            let txn = inner.txns.get_mut(&txn_id).ok_or(Error::TransactionEnded)?;

            if txn.status != TxnStatus::Active {
                return Err(Error::TransactionEnded);
            }

            if !txn.write_set.contains(key) {
                txn.read_set.insert(key.into());

                inner
                    .siread_locks
                    .entry(key.into())
                    .or_default()
                    .insert(txn_id);

                if let Some(&writer_id) = inner.write_locks.get(key) {
                    if writer_id != txn_id {
                        let writer_active = inner
                            .txns
                            .get(&writer_id)
                            .is_some_and(|w| w.status == TxnStatus::Active);

                        if writer_active {
                            Self::add_edge(&mut inner.txns, writer_id, txn_id);
                        }
                    }
                }
            }
        }

        self.store.read(txn_id, key)
    }

    /// Buffered write that also records rw-antidependencies against every
    /// SIREAD holder of the key.
    pub fn write<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        txn_id: TxnId,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        let key = key.into();
        self.lock_and_track(txn_id, &key)?;
        self.store.write(txn_id, key, value)
    }

    /// Buffered deletion; conflict-wise identical to a write.
    pub fn delete<K: Into<UserKey>>(&self, txn_id: TxnId, key: K) -> crate::Result<()> {
        let key = key.into();
        self.lock_and_track(txn_id, &key)?;
        self.store.delete(txn_id, key)
    }

    fn lock_and_track(&self, txn_id: TxnId, key: &UserKey) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *inner;

        let txn = inner.txns.get(&txn_id).ok_or(Error::TransactionEnded)?;

        if txn.status != TxnStatus::Active {
            return Err(Error::TransactionEnded);
        }

        if let Some(&holder) = inner.write_locks.get(key) {
            if holder != txn_id {
                return Err(Error::WriteConflict);
            }
        }

        // Every reader of the old version antidepends on this writer
        let readers = inner
            .siread_locks
            .get(key)
            .map(|holders| holders.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();

        for reader_id in readers {
            if reader_id == txn_id {
                continue;
            }

            let reader_relevant = inner
                .txns
                .get(&reader_id)
                .is_some_and(|r| r.status != TxnStatus::Aborted);

            if reader_relevant {
                Self::add_edge(&mut inner.txns, reader_id, txn_id);
            }
        }

        inner.write_locks.insert(key.clone(), txn_id);

        #[allow(clippy::expect_used)]
        let txn = inner.txns.get_mut(&txn_id).expect("checked above");
        txn.write_set.insert(key.clone());

        Ok(())
    }

    /// Records the rw-edge `reader → writer`.
    fn add_edge(txns: &mut FxHashMap<TxnId, SsiTxn>, reader_id: TxnId, writer_id: TxnId) {
        if let Some(reader) = txns.get_mut(&reader_id) {
            reader.out_conflict.insert(writer_id);
        }
        if let Some(writer) = txns.get_mut(&writer_id) {
            writer.in_conflict.insert(reader_id);
        }
    }

    /// Commits the transaction, or aborts it with a serialization failure
    /// if it is a pivot in a dangerous structure.
    pub fn commit(&self, txn_id: TxnId) -> crate::Result<Timestamp> {
        {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("lock is poisoned");
            let inner = &mut *inner;

            let txn = inner.txns.get(&txn_id).ok_or(Error::TransactionEnded)?;

            if txn.status != TxnStatus::Active {
                return Err(Error::TransactionEnded);
            }

            if Self::has_dangerous_structure(&inner.txns, txn) {
                Self::abort_locked(inner, txn_id);
                self.store.abort(txn_id);
                return Err(Error::SerializationFailure);
            }
        }

        let commit_ts = self.store.commit(txn_id)?;

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *inner;

        if let Some(txn) = inner.txns.get_mut(&txn_id) {
            txn.status = TxnStatus::Committed;
            txn.commit_ts = Some(commit_ts);

            // Write locks release now; SIREAD locks stay until quiescence
            let writes = txn.write_set.iter().cloned().collect::<Vec<_>>();

            for key in writes {
                if inner.write_locks.get(&key) == Some(&txn_id) {
                    inner.write_locks.remove(&key);
                }
            }
        }

        Self::sweep_quiesced(inner, self.store.min_active_start_ts());

        Ok(commit_ts)
    }

    /// Aborts the transaction, releasing all of its locks.
    pub fn abort(&self, txn_id: TxnId) {
        self.store.abort(txn_id);

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *inner;

        Self::abort_locked(inner, txn_id);
        Self::sweep_quiesced(inner, self.store.min_active_start_ts());
    }

    fn abort_locked(inner: &mut SsiInner, txn_id: TxnId) {
        let Some(txn) = inner.txns.get_mut(&txn_id) else {
            return;
        };

        txn.status = TxnStatus::Aborted;

        let reads = txn.read_set.iter().cloned().collect::<Vec<_>>();
        let writes = txn.write_set.iter().cloned().collect::<Vec<_>>();

        for key in reads {
            if let Some(holders) = inner.siread_locks.get_mut(&key) {
                holders.remove(&txn_id);
                if holders.is_empty() {
                    inner.siread_locks.remove(&key);
                }
            }
        }

        for key in writes {
            if inner.write_locks.get(&key) == Some(&txn_id) {
                inner.write_locks.remove(&key);
            }
        }
    }

    /// A pivot has an incoming and an outgoing rw-edge whose endpoints are
    /// still live, or committed after this transaction's snapshot.
    fn has_dangerous_structure(txns: &FxHashMap<TxnId, SsiTxn>, txn: &SsiTxn) -> bool {
        let relevant = |id: &TxnId| -> bool {
            let Some(other) = txns.get(id) else {
                return false;
            };

            match other.status {
                TxnStatus::Aborted => false,
                TxnStatus::Active => true,
                TxnStatus::Committed => other
                    .commit_ts
                    .map_or(true, |commit_ts| commit_ts >= txn.start_ts),
            }
        };

        txn.in_conflict.iter().any(&relevant) && txn.out_conflict.iter().any(&relevant)
    }

    /// Releases SIREAD locks of committed transactions no live snapshot
    /// overlaps, then forgets those transactions.
    fn sweep_quiesced(inner: &mut SsiInner, min_active_start: Option<Timestamp>) {
        let quiesced = inner
            .txns
            .iter()
            .filter(|(_, txn)| match txn.status {
                TxnStatus::Active => false,
                TxnStatus::Aborted => true,
                TxnStatus::Committed => txn.commit_ts.is_some_and(|commit_ts| {
                    min_active_start.map_or(true, |min_start| commit_ts <= min_start)
                }),
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for txn_id in quiesced {
            let Some(txn) = inner.txns.remove(&txn_id) else {
                continue;
            };

            for key in &txn.read_set {
                if let Some(holders) = inner.siread_locks.get_mut(key) {
                    holders.remove(&txn_id);
                    if holders.is_empty() {
                        inner.siread_locks.remove(key);
                    }
                }
            }
        }
    }

    /// Number of transactions still tracked (diagnostics).
    pub fn tracked_txn_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.txns.len()
    }
}
