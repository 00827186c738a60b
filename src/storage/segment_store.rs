// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::segment::{Record, Segment, SegmentId};
use crate::coding::Encode;
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

fn segment_file_name(id: SegmentId) -> String {
    format!("{id:06}.seg")
}

fn parse_segment_id(path: &Path) -> Option<SegmentId> {
    if path.extension()? != "seg" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

struct StoreInner {
    /// All segments, sorted by id ascending; the last one is active
    segments: Vec<Arc<Segment>>,

    /// Append handle of the active segment
    active_file: File,

    next_id: SegmentId,
}

impl StoreInner {
    #[allow(clippy::expect_used)]
    fn active(&self) -> &Arc<Segment> {
        self.segments.last().expect("store always has a segment")
    }
}

/// The durable record stream of one replica
///
/// Records are appended to the *active* segment only; once a segment reaches
/// the size threshold it is sealed and a new active segment is opened. Sealed
/// segments are immutable until compaction swaps them out.
pub struct SegmentStore {
    dir: PathBuf,
    max_segment_size: u64,

    // Single writer lock: guards segment list mutation and active-segment
    // selection. Readers iterate sealed segments without it.
    inner: Mutex<StoreInner>,
}

impl SegmentStore {
    /// Opens (or creates) a store inside `dir`, recovering all segments.
    pub fn open<P: Into<PathBuf>>(dir: P, max_segment_size: u64) -> crate::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut ids = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().and_then(|e| parse_segment_id(&e.path())))
            .collect::<Vec<_>>();

        ids.sort_unstable();

        let mut segments = Vec::with_capacity(ids.len().max(1));

        for id in ids {
            let segment = Segment::recover(id, dir.join(segment_file_name(id)))?;
            segments.push(Arc::new(segment));
        }

        if segments.is_empty() {
            let path = dir.join(segment_file_name(0));
            File::create(&path)?;
            segments.push(Arc::new(Segment::new(0, path, 0)));
        }

        log::debug!("segment store at {dir:?} recovered {} segment(s)", segments.len());

        #[allow(clippy::expect_used)]
        let active = segments.last().expect("just ensured non-empty");

        let active_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active.path)?;

        let next_id = active.id + 1;

        Ok(Self {
            dir,
            max_segment_size,
            inner: Mutex::new(StoreInner {
                segments,
                active_file,
                next_id,
            }),
        })
    }

    /// Appends a record, sealing the active segment first if it is full.
    ///
    /// The record is written with a single `write`; crash safety relies on
    /// torn-write detection at recovery time.
    pub fn append(&self, record: &Record) -> crate::Result<(SegmentId, u64)> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if inner.active().size() >= self.max_segment_size {
            self.rotate(&mut inner)?;
        }

        let bytes = record.encode_into_vec();
        inner.active_file.write_all(&bytes)?;

        let active = inner.active();
        let offset = active.grow(bytes.len() as u64);

        Ok((active.id, offset))
    }

    fn rotate(&self, inner: &mut StoreInner) -> crate::Result<()> {
        inner.active_file.sync_all()?;

        let id = inner.next_id;
        inner.next_id += 1;

        let path = self.dir.join(segment_file_name(id));
        let file = std::fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        log::trace!("sealing segment {}, opening segment {id}", inner.active().id);

        inner.segments.push(Arc::new(Segment::new(id, path, 0)));
        inner.active_file = file;

        Ok(())
    }

    /// Returns the segment with the given id, if it is still live.
    pub fn segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");

        inner
            .segments
            .iter()
            .find(|segment| segment.id == id)
            .cloned()
    }

    /// Returns a snapshot of all segments, oldest first.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.segments.clone()
    }

    /// Returns all sealed (inactive) segments, oldest first.
    pub fn sealed_segments(&self) -> Vec<Arc<Segment>> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");

        let sealed_count = inner.segments.len().saturating_sub(1);
        inner.segments.iter().take(sealed_count).cloned().collect()
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.segments.len()
    }

    /// Sum of all segment sizes in bytes.
    pub fn total_size(&self) -> u64 {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.segments.iter().map(|s| s.size()).sum()
    }

    /// Path a segment with the given id would live at.
    #[must_use]
    pub fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.dir.join(segment_file_name(id))
    }

    /// Atomically swaps compacted output in.
    ///
    /// The new segment must already be durably written and renamed into
    /// place; old files are unlinked only after the in-memory list is
    /// updated. If the new segment reuses an input's path (it inherits the
    /// smallest input id), that path survives the unlink pass.
    pub fn replace(&self, old_ids: &[SegmentId], new_segment: Segment) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let old_paths = inner
            .segments
            .iter()
            .filter(|s| old_ids.contains(&s.id) && s.path != new_segment.path)
            .map(|s| s.path.clone())
            .collect::<Vec<_>>();

        inner.segments.retain(|s| !old_ids.contains(&s.id));

        let insert_at = inner.segments.partition_point(|s| s.id < new_segment.id);
        inner.segments.insert(insert_at, Arc::new(new_segment));

        drop(inner);

        for path in old_paths {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("failed to unlink compacted segment {path:?}: {e}");
            }
        }

        Ok(())
    }
}
