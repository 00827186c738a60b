// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::segment::Record;
use crate::{
    coding::{Decode, Encode},
    UserKey, UserValue,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// A sorted, immutable table of records plus its in-memory sparse index
///
/// The data file holds records in strictly increasing key order; the index
/// file samples `(key, offset)` every `sparse_interval` records. A point
/// lookup bisects the samples and scans forward inside the bounded window.
///
/// Tombstones are stored like any other record and surface as absent keys
/// once merged away.
pub struct SsTable {
    data_path: PathBuf,
    sparse_index: Vec<(UserKey, u64)>,
    data_len: u64,
}

impl SsTable {
    fn data_path(base: &Path) -> PathBuf {
        base.with_extension("data")
    }

    fn index_path(base: &Path) -> PathBuf {
        base.with_extension("index")
    }

    /// Writes a table from records sorted by strictly increasing key.
    pub fn write<P: AsRef<Path>, I: IntoIterator<Item = Record>>(
        base: P,
        records: I,
        sparse_interval: usize,
    ) -> crate::Result<Self> {
        let base = base.as_ref();
        let sparse_interval = sparse_interval.max(1);

        let data_path = Self::data_path(base);
        let index_path = Self::index_path(base);

        let mut sparse_index = Vec::new();

        let data_file = File::create(&data_path)?;
        let mut writer = BufWriter::new(data_file);

        let mut offset = 0u64;
        let mut count = 0usize;

        for record in records {
            if count % sparse_interval == 0 {
                sparse_index.push((record.key.clone(), offset));
            }

            record.encode_into(&mut writer)?;
            offset += record.serialized_len();
            count += 1;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;

        let index_file = File::create(&index_path)?;
        let mut index_writer = BufWriter::new(index_file);

        for (key, key_offset) in &sparse_index {
            #[allow(clippy::cast_possible_truncation)]
            index_writer.write_u32::<BigEndian>(key.len() as u32)?;
            index_writer.write_u64::<BigEndian>(*key_offset)?;
            index_writer.write_all(key)?;
        }

        index_writer.flush()?;
        index_writer.get_ref().sync_all()?;

        Ok(Self {
            data_path,
            sparse_index,
            data_len: offset,
        })
    }

    /// Opens a table, loading its sparse index into memory.
    pub fn open<P: AsRef<Path>>(base: P) -> crate::Result<Self> {
        let base = base.as_ref();

        let data_path = Self::data_path(base);
        let index_path = Self::index_path(base);

        let data_len = data_path.metadata()?.len();

        let mut sparse_index = Vec::new();
        let mut reader = BufReader::new(File::open(&index_path)?);

        loop {
            let key_len = match reader.read_u32::<BigEndian>() {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            let offset = reader.read_u64::<BigEndian>()?;

            let mut key = vec![0; key_len as usize];
            reader.read_exact(&mut key)?;

            sparse_index.push((UserKey::from(key), offset));
        }

        Ok(Self {
            data_path,
            sparse_index,
            data_len,
        })
    }

    /// Byte window of the data file a key must fall into, if any.
    fn scan_window(&self, key: &[u8]) -> (u64, u64) {
        let idx = self.sparse_index.partition_point(|(k, _)| &**k <= key);

        let start = if idx == 0 {
            0
        } else {
            self.sparse_index.get(idx - 1).map_or(0, |(_, off)| *off)
        };

        let end = self
            .sparse_index
            .get(idx)
            .map_or(self.data_len, |(_, off)| *off);

        (start, end)
    }

    /// Point lookup.
    ///
    /// Returns the stored record, which may be a tombstone; the caller
    /// decides how deletions surface.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<Record>> {
        if self.sparse_index.is_empty() {
            return Ok(None);
        }

        let (start, end) = self.scan_window(key);

        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(start))?;

        let mut reader = BufReader::new(file);
        let mut pos = start;

        while pos < end {
            let record = Record::decode_from(&mut reader)?;
            pos += record.serialized_len();

            if &*record.key == key {
                return Ok(Some(record));
            }

            if &*record.key > key {
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// Streams all records with `lo <= key <= hi` in key order.
    pub fn range_scan<K: Into<UserKey>>(&self, lo: K, hi: K) -> crate::Result<RangeScan> {
        let lo = lo.into();
        let hi = hi.into();

        let (start, _) = self.scan_window(&lo);

        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(start))?;

        Ok(RangeScan {
            reader: BufReader::new(file),
            pos: start,
            data_len: self.data_len,
            lo,
            hi,
            done: false,
        })
    }

    /// Number of sampled index entries.
    #[must_use]
    pub fn sparse_len(&self) -> usize {
        self.sparse_index.len()
    }
}

/// Streaming iterator over a key range of an [`SsTable`]
pub struct RangeScan {
    reader: BufReader<File>,
    pos: u64,
    data_len: u64,
    lo: UserKey,
    hi: UserKey,
    done: bool,
}

impl Iterator for RangeScan {
    type Item = crate::Result<(UserKey, Option<UserValue>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.pos >= self.data_len {
                return None;
            }

            let record = fail_iter!(Record::decode_from(&mut self.reader));
            self.pos += record.serialized_len();

            if record.key > self.hi {
                self.done = true;
                return None;
            }

            if record.key >= self.lo {
                return Some(Ok((record.key, record.value)));
            }
        }
    }
}
