// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Simple primary/secondary replication over a write-ahead log
//!
//! The contrast variant to Raft: one fixed primary applies writes to its
//! WAL and pushes suffixes to followers. A write acks only once a strict
//! majority of the replica set (primary included) has applied it.

pub mod wal;

use crate::{
    storage::segment::Record,
    Error, UserKey, UserValue,
};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use wal::{Sequence, Wal, WalEntry};

#[derive(Default)]
struct ReplicaState {
    data: BTreeMap<UserKey, UserValue>,
    applied_seq: Sequence,
}

/// A follower applying WAL suffixes in sequence order
#[derive(Default)]
pub struct Replica {
    state: Mutex<ReplicaState>,

    /// Simulates an unreachable follower
    offline: AtomicBool,
}

impl Replica {
    /// Creates an empty follower.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a batch of entries, returning the new applied sequence.
    ///
    /// Entries at or below the applied sequence are skipped; a gap stops
    /// the batch (the primary will resend from the right position).
    pub fn apply_entries(&self, entries: &[WalEntry]) -> crate::Result<Sequence> {
        if self.offline.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::TimedOut,
            )));
        }

        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock is poisoned");

        for entry in entries {
            if entry.seq <= state.applied_seq {
                continue;
            }

            if entry.seq != state.applied_seq + 1 {
                break;
            }

            match &entry.record.value {
                Some(value) => {
                    state.data.insert(entry.record.key.clone(), value.clone());
                }
                None => {
                    state.data.remove(&entry.record.key);
                }
            }

            state.applied_seq = entry.seq;
        }

        Ok(state.applied_seq)
    }

    /// Reads a key from the follower's materialized state.
    pub fn get(&self, key: &[u8]) -> Option<UserValue> {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        state.data.get(key).cloned()
    }

    /// Highest applied sequence number.
    pub fn applied_seq(&self) -> Sequence {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock is poisoned");
        state.applied_seq
    }

    /// Makes the follower drop (or accept) replication traffic.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }
}

/// The fixed primary of a replica set
///
/// Writes go WAL-first, then into the local map, then out to followers.
/// The write returns once a strict majority of the set has applied it;
/// otherwise it fails with [`Error::QuorumLost`] (the entry stays in the
/// WAL and reaches stragglers on later syncs).
pub struct Primary {
    wal: Mutex<Wal>,
    local: Replica,
    followers: Vec<Arc<Replica>>,
}

impl Primary {
    /// Opens the primary, replaying its WAL into the local state.
    pub fn open<P: Into<PathBuf>>(
        path: P,
        followers: Vec<Arc<Replica>>,
    ) -> crate::Result<Self> {
        let wal = Wal::open(path)?;
        let local = Replica::new();

        local.apply_entries(wal.entries_from(1))?;

        Ok(Self {
            wal: Mutex::new(wal),
            local,
            followers,
        })
    }

    fn replica_set_size(&self) -> usize {
        self.followers.len() + 1
    }

    fn write(&self, record: Record) -> crate::Result<Sequence> {
        let entry = {
            #[allow(clippy::expect_used)]
            let mut wal = self.wal.lock().expect("lock is poisoned");
            wal.append(record)?
        };

        self.local.apply_entries(std::slice::from_ref(&entry))?;

        self.sync();

        // Primary counts toward the majority
        let acks = 1 + self
            .followers
            .iter()
            .filter(|f| f.applied_seq() >= entry.seq)
            .count();

        if acks * 2 > self.replica_set_size() {
            Ok(entry.seq)
        } else {
            log::warn!(
                "write {} reached only {acks}/{} replicas",
                entry.seq,
                self.replica_set_size(),
            );
            Err(Error::QuorumLost)
        }
    }

    /// Writes a key-value pair, quorum-acknowledged.
    pub fn put<K: Into<UserKey>, V: Into<UserValue>>(
        &self,
        key: K,
        value: V,
    ) -> crate::Result<Sequence> {
        self.write(Record::new(key, value))
    }

    /// Deletes a key, quorum-acknowledged.
    pub fn delete<K: Into<UserKey>>(&self, key: K) -> crate::Result<Sequence> {
        self.write(Record::tombstone(key))
    }

    /// Reads a key from the primary's state.
    pub fn get(&self, key: &[u8]) -> Option<UserValue> {
        self.local.get(key)
    }

    /// Pushes missing WAL suffixes to every follower.
    pub fn sync(&self) {
        #[allow(clippy::expect_used)]
        let wal = self.wal.lock().expect("lock is poisoned");

        for follower in &self.followers {
            let from = follower.applied_seq() + 1;
            let entries = wal.entries_from(from);

            if entries.is_empty() {
                continue;
            }

            if let Err(e) = follower.apply_entries(entries) {
                log::trace!("replication to follower lost: {e}");
            }
        }
    }

    /// Per-follower lag in entries behind the primary.
    #[must_use]
    pub fn replication_lag(&self) -> Vec<Sequence> {
        #[allow(clippy::expect_used)]
        let wal = self.wal.lock().expect("lock is poisoned");
        let head = wal.last_seq();

        self.followers
            .iter()
            .map(|f| head.saturating_sub(f.applied_seq()))
            .collect()
    }

    /// Blocks until every follower applied `seq`, or the deadline passes.
    pub fn wait_for_replication(&self, seq: Sequence, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            self.sync();

            if self.followers.iter().all(|f| f.applied_seq() >= seq) {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }

            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn replica_set(n: usize) -> Vec<Arc<Replica>> {
        (0..n).map(|_| Arc::new(Replica::new())).collect()
    }

    #[test]
    fn repl_quorum_ack() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let followers = replica_set(2);
        let primary = Primary::open(dir.path().join("wal"), followers.clone())?;

        let seq = primary.put("k", "v")?;
        assert_eq!(1, seq);

        for follower in &followers {
            assert_eq!(Some("v".into()), follower.get(b"k"));
        }

        Ok(())
    }

    #[test]
    fn repl_minority_write_fails() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let followers = replica_set(2);
        let primary = Primary::open(dir.path().join("wal"), followers.clone())?;

        // Both followers gone: 1 of 3 replicas is no majority
        for follower in &followers {
            follower.set_offline(true);
        }

        assert!(matches!(primary.put("k", "v"), Err(Error::QuorumLost)));

        // One follower back: 2 of 3 is a majority again
        followers
            .first()
            .ok_or(Error::Unrecoverable)?
            .set_offline(false);

        primary.put("k2", "v2")?;

        Ok(())
    }

    #[test]
    fn repl_straggler_catches_up() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let followers = replica_set(2);
        let primary = Primary::open(dir.path().join("wal"), followers.clone())?;

        let straggler = followers.get(1).cloned().ok_or(Error::Unrecoverable)?;
        straggler.set_offline(true);

        for i in 0..5u32 {
            primary.put(format!("key_{i}"), "v")?;
        }

        assert_eq!(vec![0, 5], primary.replication_lag());

        straggler.set_offline(false);
        assert!(primary.wait_for_replication(5, Duration::from_secs(2)));

        assert_eq!(vec![0, 0], primary.replication_lag());
        assert_eq!(Some("v".into()), straggler.get(b"key_4"));

        Ok(())
    }

    #[test]
    fn repl_primary_recovers_from_wal() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wal");

        {
            let primary = Primary::open(&path, replica_set(0))?;
            primary.put("a", "1")?;
            primary.put("b", "2")?;
            primary.delete("a")?;
        }

        let primary = Primary::open(&path, replica_set(0))?;
        assert_eq!(None, primary.get(b"a"));
        assert_eq!(Some("2".into()), primary.get(b"b"));

        Ok(())
    }
}
