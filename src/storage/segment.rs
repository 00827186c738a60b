// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    UserKey, UserValue,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

/// Monotonically increasing segment identifier
///
/// Compaction may reuse the *smallest* id of its inputs for the merged output.
pub type SegmentId = u64;

/// Fixed record header: key length, value length, tombstone marker
pub const RECORD_HEADER_SIZE: u64 = 4 + 4 + 1;

/// A single record in a segment file
///
/// Tombstones carry an empty value and `deleted=1` on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    /// Record key
    pub key: UserKey,

    /// Record value; `None` marks a tombstone
    pub value: Option<UserValue>,
}

impl Record {
    /// Creates a live record.
    pub fn new<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Creates a tombstone.
    pub fn tombstone<K: Into<UserKey>>(key: K) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Returns `true` if this record marks a deletion.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// On-disk size of this record in bytes.
    #[must_use]
    pub fn serialized_len(&self) -> u64 {
        RECORD_HEADER_SIZE
            + self.key.len() as u64
            + self.value.as_ref().map_or(0, |v| v.len() as u64)
    }
}

impl Encode for Record {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Keys are u32-bounded by construction (they come from u32 reads)
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.key.len() as u32)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.value.as_ref().map_or(0, |v| v.len() as u32))?;

        writer.write_u8(u8::from(self.is_tombstone()))?;
        writer.write_all(&self.key)?;

        if let Some(value) = &self.value {
            writer.write_all(value)?;
        }

        Ok(())
    }
}

impl Decode for Record {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_len = reader.read_u32::<BigEndian>()?;
        let value_len = reader.read_u32::<BigEndian>()?;
        let deleted = reader.read_u8()?;

        let mut key = vec![0; key_len as usize];
        reader.read_exact(&mut key)?;

        let value = if deleted > 0 {
            None
        } else {
            let mut value = vec![0; value_len as usize];
            reader.read_exact(&mut value)?;
            Some(UserValue::from(value))
        };

        Ok(Self {
            key: UserKey::from(key),
            value,
        })
    }
}

/// An append-only log segment
///
/// The newest segment is the only one written to; older segments are sealed
/// and immutable until compaction unlinks them. Offsets are stable once
/// written.
#[derive(Debug)]
pub struct Segment {
    /// Segment id
    pub id: SegmentId,

    /// Path of the segment file
    pub path: PathBuf,

    size: AtomicU64,
}

impl Segment {
    pub(crate) fn new(id: SegmentId, path: PathBuf, size: u64) -> Self {
        Self {
            id,
            path,
            size: AtomicU64::new(size),
        }
    }

    /// Current size of the segment in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn grow(&self, bytes: u64) -> u64 {
        self.size.fetch_add(bytes, Ordering::AcqRel)
    }

    /// Loads a segment from disk, truncating a torn trailing record.
    ///
    /// A crashed writer may leave a record that declares more bytes than the
    /// file holds; such a tail is silently dropped.
    pub fn recover<P: Into<PathBuf>>(id: SegmentId, path: P) -> crate::Result<Self> {
        let path = path.into();
        let file_len = path.metadata()?.len();

        let mut valid_len = 0u64;

        {
            let file = File::open(&path)?;
            let mut iter = SegmentIter::new(file);

            while let Some(item) = iter.next() {
                let (offset, record) = item?;
                valid_len = offset + record.serialized_len();
            }
        }

        if valid_len < file_len {
            log::warn!(
                "segment {id} at {path:?}: dropping torn tail ({} of {file_len} bytes valid)",
                valid_len,
            );

            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self::new(id, path, valid_len))
    }

    /// Reads the record at the given offset.
    pub fn read_at(&self, offset: u64) -> crate::Result<Record> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut reader = BufReader::new(file);
        Ok(Record::decode_from(&mut reader)?)
    }

    /// Sequentially scans the segment.
    ///
    /// The scan is lazy, finite and restartable; a short trailing record
    /// terminates it silently.
    pub fn iter(&self) -> crate::Result<SegmentIter> {
        Ok(SegmentIter::new(File::open(&self.path)?))
    }
}

/// Iterator over `(offset, record)` pairs of a segment file
pub struct SegmentIter {
    reader: BufReader<File>,
    offset: u64,
    done: bool,
}

impl SegmentIter {
    fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
            offset: 0,
            done: false,
        }
    }
}

impl Iterator for SegmentIter {
    type Item = crate::Result<(u64, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match Record::decode_from(&mut self.reader) {
            Ok(record) => {
                let offset = self.offset;
                self.offset += record.serialized_len();
                Some(Ok((offset, record)))
            }
            Err(DecodeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Torn or absent trailing record
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// Writes a fresh segment file record by record
///
/// Used for compaction outputs and flushes; the active segment of a
/// [`super::segment_store::SegmentStore`] keeps its own append handle.
pub struct SegmentWriter {
    id: SegmentId,
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl SegmentWriter {
    /// Creates a segment file at `path`, failing if it exists.
    pub fn create<P: AsRef<Path>>(id: SegmentId, path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            writer: BufWriter::new(file),
            size: 0,
        })
    }

    /// Appends a record, returning its offset.
    pub fn append(&mut self, record: &Record) -> crate::Result<u64> {
        let offset = self.size;
        record.encode_into(&mut self.writer)?;
        self.size += record.serialized_len();
        Ok(offset)
    }

    /// Flushes and fsyncs the file, returning the finished [`Segment`].
    pub fn finish(mut self) -> crate::Result<Segment> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(Segment::new(self.id, self.path, self.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn record_round_trip() -> crate::Result<()> {
        let record = Record::new("hello", "world");

        let bytes = record.encode_into_vec();
        assert_eq!(bytes.len() as u64, record.serialized_len());

        let decoded = Record::decode_from(&mut &bytes[..])?;
        assert_eq!(record, decoded);

        Ok(())
    }

    #[test]
    fn record_tombstone_round_trip() -> crate::Result<()> {
        let record = Record::tombstone("gone");
        assert!(record.is_tombstone());

        let bytes = record.encode_into_vec();
        let decoded = Record::decode_from(&mut &bytes[..])?;

        assert!(decoded.is_tombstone());
        assert_eq!(record, decoded);

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn segment_write_scan() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000000.seg");

        let mut writer = SegmentWriter::create(0, &path)?;
        writer.append(&Record::new("a", "1"))?;
        writer.append(&Record::new("b", "2"))?;
        writer.append(&Record::tombstone("a"))?;
        let segment = writer.finish()?;

        let items = segment.iter()?.collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(3, items.len());

        let (offset, record) = items.get(1).cloned().unwrap();
        assert_eq!(record, segment.read_at(offset)?);

        Ok(())
    }

    #[test]
    fn segment_torn_tail_is_dropped() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000000.seg");

        let mut writer = SegmentWriter::create(0, &path)?;
        writer.append(&Record::new("a", "1"))?;
        writer.append(&Record::new("b", "2"))?;
        let full_len = writer.finish()?.size();

        // Simulate a crash mid-append: header promises more bytes than exist
        {
            use std::io::Write;

            let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
            file.write_all(&[0, 0, 0, 9, 0, 0, 0, 9, 0, b'x'])?;
        }

        let segment = Segment::recover(0, &path)?;
        assert_eq!(full_len, segment.size());
        assert_eq!(full_len, path.metadata()?.len());

        let items = segment.iter()?.collect::<crate::Result<Vec<_>>>()?;
        assert_eq!(2, items.len());

        Ok(())
    }
}
