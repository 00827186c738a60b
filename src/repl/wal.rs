// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, Encode},
    storage::segment::Record,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::PathBuf,
};

/// WAL sequence number, starting at 1
pub type Sequence = u64;

/// One write-ahead-log record
#[derive(Clone, Debug, PartialEq)]
pub struct WalEntry {
    /// Position in the WAL
    pub seq: Sequence,

    /// The operation (a tombstone record is a delete)
    pub record: Record,
}

/// Simple write-ahead log for the primary/secondary replication variant
///
/// Wire format per entry: `seq:u64 | key_len:u32 | value_len:u32 |
/// deleted:u8 | key | value`. A torn trailing entry is dropped at load.
pub struct Wal {
    path: PathBuf,
    file: File,
    entries: Vec<WalEntry>,
}

impl Wal {
    /// Opens (or creates) the log file, replaying it into memory.
    pub fn open<P: Into<PathBuf>>(path: P) -> crate::Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries: Vec<WalEntry> = Vec::new();
        let mut valid_len = 0u64;

        if path.exists() {
            let file_len = path.metadata()?.len();
            let mut reader = BufReader::new(File::open(&path)?);

            loop {
                let seq = match reader.read_u64::<BigEndian>() {
                    Ok(v) => v,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                };

                let Ok(record) = Record::decode_from(&mut reader) else {
                    break;
                };

                valid_len += 8 + record.serialized_len();
                entries.push(WalEntry { seq, record });
            }

            if valid_len < file_len {
                log::warn!(
                    "wal {path:?}: dropping torn tail ({valid_len} of {file_len} bytes valid)"
                );

                let file = std::fs::OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            entries,
        })
    }

    /// Appends a record under the next sequence number.
    pub fn append(&mut self, record: Record) -> crate::Result<WalEntry> {
        let seq = self.last_seq() + 1;

        let mut buf = Vec::with_capacity(8 + record.serialized_len() as usize);
        buf.write_u64::<BigEndian>(seq)?;
        record.encode_into(&mut buf)?;

        self.file.write_all(&buf)?;
        self.file.sync_data()?;

        let entry = WalEntry { seq, record };
        self.entries.push(entry.clone());

        Ok(entry)
    }

    /// All entries with `entry.seq >= seq`.
    #[must_use]
    pub fn entries_from(&self, seq: Sequence) -> &[WalEntry] {
        let offset = self
            .entries
            .iter()
            .position(|e| e.seq >= seq)
            .unwrap_or(self.entries.len());

        #[allow(clippy::indexing_slicing)]
        &self.entries[offset..]
    }

    /// Highest sequence number (0 when empty).
    #[must_use]
    pub fn last_seq(&self) -> Sequence {
        self.entries.last().map_or(0, |e| e.seq)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
