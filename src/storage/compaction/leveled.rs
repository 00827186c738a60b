// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    key_range::KeyRange,
    storage::segment::{Record, Segment, SegmentWriter},
    UserKey, UserValue,
};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

struct LevelSegment {
    segment: Arc<Segment>,
    key_range: KeyRange,
}

/// Leveled compaction over immutable segments
///
/// Segments are grouped into levels; level `L` may hold up to
/// `ratio^(L+1) · base` bytes. When a level overflows, its oldest segment is
/// merged with all key-range-overlapping segments of the next level and the
/// result is written into that next level. Within a merge the upper (newer)
/// level shadows the lower one, and a tombstone masks the same key below it;
/// tombstones are dropped once they reach the lowest level.
pub struct LeveledCompactor {
    dir: PathBuf,
    base_size: u64,
    ratio: u64,
    levels: Mutex<Vec<Vec<LevelSegment>>>,
    next_id: AtomicU64,
}

impl LeveledCompactor {
    /// Creates a compactor with `max_levels` levels inside `dir`.
    pub fn new<P: Into<PathBuf>>(
        dir: P,
        max_levels: usize,
        ratio: u64,
        base_size: u64,
    ) -> crate::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            base_size,
            ratio,
            levels: Mutex::new((0..max_levels.max(2)).map(|_| Vec::new()).collect()),
            next_id: AtomicU64::new(0),
        })
    }

    fn size_limit(&self, level: usize) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let exp = (level + 1) as u32;
        self.base_size.saturating_mul(self.ratio.saturating_pow(exp))
    }

    fn segment_path(&self, level: usize, id: u64) -> PathBuf {
        self.dir.join(format!("level{level}_{id:06}.seg"))
    }

    /// Writes `records` into a fresh level-0 segment, then rebalances.
    pub fn ingest<I: IntoIterator<Item = Record>>(&self, records: I) -> crate::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let path = self.segment_path(0, id);

        let mut writer = SegmentWriter::create(id, &path)?;

        let mut min: Option<UserKey> = None;
        let mut max: Option<UserKey> = None;

        for record in records {
            if min.as_ref().map_or(true, |m| record.key < *m) {
                min = Some(record.key.clone());
            }
            if max.as_ref().map_or(true, |m| record.key > *m) {
                max = Some(record.key.clone());
            }
            writer.append(&record)?;
        }

        let (Some(min), Some(max)) = (min, max) else {
            // Nothing written
            std::fs::remove_file(&path).ok();
            return Ok(());
        };

        let segment = Arc::new(writer.finish()?);

        {
            #[allow(clippy::expect_used)]
            let mut levels = self.levels.lock().expect("lock is poisoned");

            #[allow(clippy::expect_used)]
            levels
                .first_mut()
                .expect("always has levels")
                .push(LevelSegment {
                    segment,
                    key_range: KeyRange::new((min, max)),
                });
        }

        self.rebalance()
    }

    fn level_size(levels: &[Vec<LevelSegment>], level: usize) -> u64 {
        levels
            .get(level)
            .map_or(0, |l| l.iter().map(|s| s.segment.size()).sum())
    }

    /// Compacts every overflowing level, top-down, until all limits hold.
    pub fn rebalance(&self) -> crate::Result<()> {
        let level_count = {
            #[allow(clippy::expect_used)]
            let levels = self.levels.lock().expect("lock is poisoned");
            levels.len()
        };

        for level in 0..level_count - 1 {
            loop {
                let over = {
                    #[allow(clippy::expect_used)]
                    let levels = self.levels.lock().expect("lock is poisoned");

                    Self::level_size(&levels, level) > self.size_limit(level)
                        && !levels.get(level).map_or(true, Vec::is_empty)
                };

                if !over {
                    break;
                }

                self.compact_level(level)?;
            }
        }

        Ok(())
    }

    /// Merges the oldest segment of `level` into `level + 1`.
    pub fn compact_level(&self, level: usize) -> crate::Result<()> {
        let (upper, overlapping, target_is_bottom) = {
            #[allow(clippy::expect_used)]
            let mut levels = self.levels.lock().expect("lock is poisoned");

            let bottom = levels.len() - 1;

            let Some(source) = levels.get_mut(level) else {
                return Ok(());
            };

            if source.is_empty() {
                return Ok(());
            }

            let upper = source.remove(0);

            #[allow(clippy::expect_used)]
            let next = levels.get_mut(level + 1).expect("never called on bottom");

            let mut overlapping = Vec::new();
            let mut idx = 0;

            while idx < next.len() {
                if next
                    .get(idx)
                    .is_some_and(|s| s.key_range.overlaps_with(&upper.key_range))
                {
                    overlapping.push(next.remove(idx));
                } else {
                    idx += 1;
                }
            }

            (upper, overlapping, level + 1 == bottom)
        };

        let mut merged: BTreeMap<UserKey, Option<UserValue>> = BTreeMap::new();

        // Lower level first (older), higher segment id wins within it
        let mut lower_inputs = overlapping;
        lower_inputs.sort_by_key(|s| s.segment.id);

        for input in &lower_inputs {
            for item in input.segment.iter()? {
                let (_, record) = item?;
                merged.insert(record.key, record.value);
            }
        }

        // Upper level shadows
        for item in upper.segment.iter()? {
            let (_, record) = item?;
            merged.insert(record.key, record.value);
        }

        if target_is_bottom {
            // Consumed tombstones: nothing below can resurrect the key
            merged.retain(|_, value| value.is_some());
        }

        let old_paths = lower_inputs
            .iter()
            .map(|s| s.segment.path.clone())
            .chain(std::iter::once(upper.segment.path.clone()))
            .collect::<Vec<_>>();

        if !merged.is_empty() {
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let path = self.segment_path(level + 1, id);

            let mut writer = SegmentWriter::create(id, &path)?;

            #[allow(clippy::expect_used)]
            let min = merged.keys().next().expect("not empty").clone();

            #[allow(clippy::expect_used)]
            let max = merged.keys().next_back().expect("not empty").clone();

            for (key, value) in merged {
                writer.append(&Record { key, value })?;
            }

            let segment = Arc::new(writer.finish()?);

            log::trace!(
                "leveled: merged 1+{} segment(s) from level {level} into level {} segment {id}",
                lower_inputs.len(),
                level + 1,
            );

            #[allow(clippy::expect_used)]
            let mut levels = self.levels.lock().expect("lock is poisoned");

            #[allow(clippy::expect_used)]
            levels
                .get_mut(level + 1)
                .expect("never called on bottom")
                .push(LevelSegment {
                    segment,
                    key_range: KeyRange::new((min, max)),
                });
        }

        for path in old_paths {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("failed to unlink merged segment {path:?}: {e}");
            }
        }

        Ok(())
    }

    /// Point lookup across all levels, newest data first.
    ///
    /// Only used to validate merge semantics; levels are not a serving index.
    pub fn lookup(&self, key: &[u8]) -> crate::Result<Option<UserValue>> {
        let candidates = {
            #[allow(clippy::expect_used)]
            let levels = self.levels.lock().expect("lock is poisoned");

            let mut candidates = Vec::new();

            for level in levels.iter() {
                // Within a level, newest segment first
                for entry in level.iter().rev() {
                    if entry.key_range.contains_key(key) {
                        candidates.push(entry.segment.clone());
                    }
                }
            }

            candidates
        };

        for segment in candidates {
            let mut newest: Option<Record> = None;

            for item in segment.iter()? {
                let (_, record) = item?;
                if &*record.key == key {
                    newest = Some(record);
                }
            }

            if let Some(record) = newest {
                return Ok(record.value);
            }
        }

        Ok(None)
    }

    /// Number of segments per level.
    pub fn level_counts(&self) -> Vec<usize> {
        #[allow(clippy::expect_used)]
        let levels = self.levels.lock().expect("lock is poisoned");
        levels.iter().map(Vec::len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn leveled_upper_shadows_lower() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let compactor = LeveledCompactor::new(dir.path(), 3, 10, 1024 * 1024)?;

        compactor.ingest(vec![Record::new("a", "old"), Record::new("b", "1")])?;
        compactor.compact_level(0)?;

        compactor.ingest(vec![Record::new("a", "new")])?;
        compactor.compact_level(0)?;

        assert_eq!(Some("new".into()), compactor.lookup(b"a")?);
        assert_eq!(Some("1".into()), compactor.lookup(b"b")?);

        Ok(())
    }

    #[test]
    fn leveled_tombstone_masks_and_drops_at_bottom() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let compactor = LeveledCompactor::new(dir.path(), 2, 10, 1024 * 1024)?;

        compactor.ingest(vec![Record::new("doomed", "value"), Record::new("kept", "v")])?;
        compactor.compact_level(0)?;

        compactor.ingest(vec![Record::tombstone("doomed")])?;
        compactor.compact_level(0)?;

        assert_eq!(None, compactor.lookup(b"doomed")?);
        assert_eq!(Some("v".into()), compactor.lookup(b"kept")?);

        // Level 1 is the bottom, so the tombstone itself was consumed
        let bottom = compactor.level_counts();
        assert_eq!(vec![0, 1], bottom);

        Ok(())
    }

    #[test]
    fn leveled_overflow_cascades() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        // Tiny limits force compaction on every ingest
        let compactor = LeveledCompactor::new(dir.path(), 3, 2, 16)?;

        for i in 0..20u32 {
            compactor.ingest(vec![Record::new(
                format!("key_{i:04}"),
                "some_longer_value_payload",
            )])?;
        }

        let counts = compactor.level_counts();
        assert!(counts.iter().skip(1).any(|&c| c > 0), "{counts:?}");

        for i in 0..20u32 {
            assert_eq!(
                Some("some_longer_value_payload".into()),
                compactor.lookup(format!("key_{i:04}").as_bytes())?,
                "key_{i:04}",
            );
        }

        Ok(())
    }
}
