// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{LogIndex, NodeId, Term};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Read, Write},
    path::PathBuf,
};

/// One replicated command
///
/// Indices are contiguous starting at 1 and never reused; the term of entry
/// `i` is non-decreasing in `i`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term the entry was proposed in
    pub term: Term,

    /// Position in the log
    pub index: LogIndex,

    /// Opaque state-machine command
    pub command: serde_json::Value,
}

/// Size of the fixed wire header: `{ term:u64, index:u64, cmd_len:u32 }`
const ENTRY_HEADER_SIZE: u64 = 8 + 8 + 4;

/// Durable command log of one Raft node
///
/// Appends are O(1) writes of `header | command-json`. Suffix truncation
/// (follower log divergence) and prefix compaction (after a snapshot)
/// rewrite the file under a temporary name; both are rare.
///
/// Not internally synchronized: the node keeps it under its state mutex.
pub struct PersistentLog {
    path: PathBuf,
    file: File,

    /// Entries held in memory; `entries[0]` has index `first_index`
    entries: Vec<LogEntry>,

    /// Index of the first retained entry (1, or `last_included + 1` after
    /// prefix compaction)
    first_index: LogIndex,
}

impl PersistentLog {
    /// Opens (or creates) the log file, dropping a torn trailing record.
    pub fn open<P: Into<PathBuf>>(path: P) -> crate::Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        let mut valid_len = 0u64;

        if path.exists() {
            let file_len = path.metadata()?.len();
            let mut reader = BufReader::new(File::open(&path)?);

            loop {
                let term = match reader.read_u64::<BigEndian>() {
                    Ok(v) => v,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                };

                let (Ok(index), Ok(cmd_len)) = (
                    reader.read_u64::<BigEndian>(),
                    reader.read_u32::<BigEndian>(),
                ) else {
                    break;
                };

                let mut cmd = vec![0; cmd_len as usize];
                if reader.read_exact(&mut cmd).is_err() {
                    break;
                }

                let Ok(command) = serde_json::from_slice(&cmd) else {
                    break;
                };

                entries.push(LogEntry {
                    term,
                    index,
                    command,
                });

                valid_len += ENTRY_HEADER_SIZE + u64::from(cmd_len);
            }

            if valid_len < file_len {
                log::warn!(
                    "raft log {path:?}: dropping torn tail ({valid_len} of {file_len} bytes valid)"
                );

                let file = std::fs::OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let first_index = entries.first().map_or(1, |e| e.index);

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            entries,
            first_index,
        })
    }

    fn encode_entry(entry: &LogEntry) -> crate::Result<Vec<u8>> {
        let cmd = serde_json::to_vec(&entry.command)?;

        let mut buf = Vec::with_capacity(cmd.len() + ENTRY_HEADER_SIZE as usize);
        buf.write_u64::<BigEndian>(entry.term)?;
        buf.write_u64::<BigEndian>(entry.index)?;

        #[allow(clippy::cast_possible_truncation)]
        buf.write_u32::<BigEndian>(cmd.len() as u32)?;
        buf.write_all(&cmd)?;

        Ok(buf)
    }

    /// Appends a command under the given term, assigning the next index.
    pub fn append(&mut self, term: Term, command: serde_json::Value) -> crate::Result<LogEntry> {
        let entry = LogEntry {
            term,
            index: self.last_index() + 1,
            command,
        };

        self.append_entry(entry.clone())?;
        Ok(entry)
    }

    /// Appends a replicated entry carrying its own term and index.
    pub fn append_entry(&mut self, entry: LogEntry) -> crate::Result<()> {
        debug_assert_eq!(entry.index, self.last_index() + 1, "index gap");

        let buf = Self::encode_entry(&entry)?;
        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        self.entries.push(entry);
        Ok(())
    }

    /// Entry at `index`, if retained.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }

        self.entries.get((index - self.first_index) as usize)
    }

    /// All retained entries with `entry.index >= index`.
    #[must_use]
    pub fn entries_from(&self, index: LogIndex) -> &[LogEntry] {
        let start = index.max(self.first_index);
        let offset = ((start - self.first_index) as usize).min(self.entries.len());

        #[allow(clippy::indexing_slicing)]
        &self.entries[offset..]
    }

    /// Term of the entry at `index`, if retained.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.get(index).map(|e| e.term)
    }

    /// Highest stored index (0 when empty and never compacted).
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        self.first_index - 1 + self.entries.len() as u64
    }

    /// Term of the last stored entry, if any entry is retained.
    #[must_use]
    pub fn last_term(&self) -> Option<Term> {
        self.entries.last().map(|e| e.term)
    }

    /// Index of the first retained entry.
    #[must_use]
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entry is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-bases an empty log after a snapshot restore.
    pub fn set_first_index(&mut self, first_index: LogIndex) {
        debug_assert!(self.entries.is_empty());
        self.first_index = first_index;
    }

    /// Drops every entry with `entry.index >= index` (follower divergence).
    pub fn truncate_from(&mut self, index: LogIndex) -> crate::Result<()> {
        if index > self.last_index() {
            return Ok(());
        }

        let keep = index.saturating_sub(self.first_index) as usize;
        self.entries.truncate(keep);

        self.rewrite()
    }

    /// Drops every entry with `entry.index <= up_to` (snapshot compaction).
    pub fn compact_prefix(&mut self, up_to: LogIndex) -> crate::Result<()> {
        if up_to < self.first_index {
            return Ok(());
        }

        let drop_count = ((up_to - self.first_index + 1) as usize).min(self.entries.len());
        self.entries.drain(0..drop_count);
        self.first_index = up_to + 1;

        self.rewrite()
    }

    /// Rewrites the whole file from the retained prefix, atomically.
    fn rewrite(&mut self) -> crate::Result<()> {
        let tmp_path = self.path.with_extension("log.tmp");

        {
            let mut tmp = File::create(&tmp_path)?;

            for entry in &self.entries {
                tmp.write_all(&Self::encode_entry(entry)?)?;
            }

            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        self.file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

/// Durable election state: `current_term` and `voted_for`
///
/// Written with fsync on every mutation; losing a vote record could elect
/// two leaders in one term, so a failed save must stop the node.
pub struct MetadataStore {
    path: PathBuf,
    current_term: Term,
    voted_for: Option<NodeId>,
}

impl MetadataStore {
    /// Opens (or creates) the metadata file.
    pub fn open<P: Into<PathBuf>>(path: P) -> crate::Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut current_term = 0;
        let mut voted_for = None;

        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);

            if let (Ok(term), Ok(voted)) = (
                reader.read_u64::<BigEndian>(),
                reader.read_i64::<BigEndian>(),
            ) {
                current_term = term;
                voted_for = u64::try_from(voted).ok();
            }
        }

        Ok(Self {
            path,
            current_term,
            voted_for,
        })
    }

    /// Current term.
    #[must_use]
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Vote cast in the current term, if any.
    #[must_use]
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Persists a new term and vote, fsynced before returning.
    pub fn save(&mut self, term: Term, voted_for: Option<NodeId>) -> crate::Result<()> {
        let tmp_path = self.path.with_extension("meta.tmp");

        #[allow(clippy::cast_possible_wrap)]
        let voted = voted_for.map_or(-1_i64, |id| id as i64);

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_u64::<BigEndian>(term)?;
            tmp.write_i64::<BigEndian>(voted)?;
            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        self.current_term = term;
        self.voted_for = voted_for;

        Ok(())
    }
}
