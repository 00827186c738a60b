// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::{
    io::Write,
    path::{Path, PathBuf},
};

/// A self-describing state-machine snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Highest log index the snapshot covers
    pub last_included_index: LogIndex,

    /// Term of the entry at `last_included_index`
    pub last_included_term: Term,

    /// Machine state as produced by [`super::StateMachine::snapshot`]
    pub state: serde_json::Value,
}

/// Stores the (single) snapshot file of a node
///
/// Written atomically via temp-file + rename, so a crash mid-write leaves
/// the previous snapshot intact.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Creates a store writing to `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Loads the snapshot, if one exists.
    pub fn load(&self) -> crate::Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Atomically replaces the snapshot.
    pub fn save(&self, snapshot: &Snapshot) -> crate::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec(snapshot)?)?;
        tmp.as_file().sync_all()?;

        tmp.persist(&self.path)
            .map_err(|e| crate::Error::Io(e.error))?;

        log::debug!(
            "snapshot saved through index {} (term {})",
            snapshot.last_included_index,
            snapshot.last_included_term,
        );

        Ok(())
    }
}
