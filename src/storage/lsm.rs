// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{memtable::Memtable, segment::Record, sstable::SsTable};
use crate::{KvPair, UserKey, UserValue};
use std::{
    collections::BTreeMap,
    ops::Bound,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

fn table_base_name(id: u64) -> String {
    format!("sstable_{id:06}")
}

struct LsmState {
    active: Arc<Memtable>,
    sealed: Option<Arc<Memtable>>,
    tables: Vec<Arc<SsTable>>,
    next_table_id: u64,
}

struct LsmInner {
    dir: PathBuf,
    memtable_size: usize,
    sparse_interval: usize,
    state: RwLock<LsmState>,

    // Serializes seal-and-flush so only one writer rotates at a time
    flush_lock: Mutex<()>,
}

/// LSM-tree variant of the storage engine
///
/// Writes land in an in-memory [`Memtable`]; once it holds `memtable_size`
/// records it is sealed and flushed into an immutable [`SsTable`]. Point
/// reads check the active memtable, the sealed memtable, then SSTables
/// newest-first. Deletes insert tombstones that flush like any other record.
#[derive(Clone)]
pub struct LsmTree(Arc<LsmInner>);

impl LsmTree {
    /// Opens (or creates) an LSM tree inside `dir`, re-listing existing
    /// SSTables.
    pub fn open<P: Into<PathBuf>>(
        dir: P,
        memtable_size: usize,
        sparse_interval: usize,
    ) -> crate::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut ids = std::fs::read_dir(&dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension()? != "data" {
                    return None;
                }
                let stem = path.file_stem()?.to_str()?;
                stem.strip_prefix("sstable_")?.parse::<u64>().ok()
            })
            .collect::<Vec<_>>();

        ids.sort_unstable();

        let mut tables = Vec::with_capacity(ids.len());
        for id in &ids {
            tables.push(Arc::new(SsTable::open(dir.join(table_base_name(*id)))?));
        }

        let next_table_id = ids.last().map_or(0, |id| id + 1);

        log::debug!("lsm tree at {dir:?} recovered {} sstable(s)", tables.len());

        Ok(Self(Arc::new(LsmInner {
            dir,
            memtable_size: memtable_size.max(1),
            sparse_interval,
            state: RwLock::new(LsmState {
                active: Arc::new(Memtable::new()),
                sealed: None,
                tables,
                next_table_id,
            }),
            flush_lock: Mutex::new(()),
        })))
    }

    /// Inserts a key-value pair, flushing the memtable if it is full.
    pub fn put<K: Into<UserKey>, V: Into<UserValue>>(&self, key: K, value: V) -> crate::Result<()> {
        self.insert(key.into(), Some(value.into()))
    }

    /// Inserts a tombstone for a key.
    pub fn delete<K: Into<UserKey>>(&self, key: K) -> crate::Result<()> {
        self.insert(key.into(), None)
    }

    fn insert(&self, key: UserKey, value: Option<UserValue>) -> crate::Result<()> {
        let needs_flush = {
            #[allow(clippy::expect_used)]
            let state = self.0.state.read().expect("lock is poisoned");

            state.active.insert(key, value);
            state.active.len() >= self.0.memtable_size
        };

        if needs_flush {
            self.flush()?;
        }

        Ok(())
    }

    /// Point lookup across memtables and SSTables.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<UserValue>> {
        #[allow(clippy::expect_used)]
        let state = self.0.state.read().expect("lock is poisoned");

        if let Some(value) = state.active.get(key) {
            return Ok(value);
        }

        if let Some(sealed) = &state.sealed {
            if let Some(value) = sealed.get(key) {
                return Ok(value);
            }
        }

        for table in state.tables.iter().rev() {
            if let Some(record) = table.get(key)? {
                return Ok(record.value);
            }
        }

        Ok(None)
    }

    /// Returns all live pairs with `lo <= key <= hi`, newest version wins.
    pub fn range<K: Into<UserKey>>(&self, lo: K, hi: K) -> crate::Result<Vec<KvPair>> {
        let lo = lo.into();
        let hi = hi.into();

        #[allow(clippy::expect_used)]
        let state = self.0.state.read().expect("lock is poisoned");

        let mut merged: BTreeMap<UserKey, Option<UserValue>> = BTreeMap::new();

        // Oldest first, so later (newer) sources shadow
        for table in &state.tables {
            for item in table.range_scan(lo.clone(), hi.clone())? {
                let (key, value) = item?;
                merged.insert(key, value);
            }
        }

        if let Some(sealed) = &state.sealed {
            for (key, value) in sealed.range((Bound::Included(&*lo), Bound::Included(&*hi))) {
                merged.insert(key, value);
            }
        }

        for (key, value) in state
            .active
            .range((Bound::Included(&*lo), Bound::Included(&*hi)))
        {
            merged.insert(key, value);
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    /// Seals the active memtable and flushes it to an SSTable.
    pub fn flush(&self) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let _flush_guard = self.0.flush_lock.lock().expect("lock is poisoned");

        let (sealed, table_id) = {
            #[allow(clippy::expect_used)]
            let mut state = self.0.state.write().expect("lock is poisoned");

            if state.active.is_empty() {
                return Ok(());
            }

            let sealed = std::mem::replace(&mut state.active, Arc::new(Memtable::new()));
            state.sealed = Some(sealed.clone());

            let table_id = state.next_table_id;
            state.next_table_id += 1;

            (sealed, table_id)
        };

        log::trace!("flushing memtable with {} record(s)", sealed.len());

        let records = sealed.iter().map(|(key, value)| Record { key, value });
        let table = SsTable::write(
            self.0.dir.join(table_base_name(table_id)),
            records,
            self.0.sparse_interval,
        )?;

        {
            #[allow(clippy::expect_used)]
            let mut state = self.0.state.write().expect("lock is poisoned");
            state.tables.push(Arc::new(table));
            state.sealed = None;
        }

        Ok(())
    }

    /// Number of SSTables on disk.
    pub fn table_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        let state = self.0.state.read().expect("lock is poisoned");
        state.tables.len()
    }
}
