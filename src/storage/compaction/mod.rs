// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod leveled;

use super::{
    segment::{Record, Segment, SegmentId, SegmentWriter},
    segment_store::SegmentStore,
};
use crate::{shutdown::Shutdown, UserKey, UserValue};
use std::{collections::BTreeMap, time::Duration};

/// Outcome of one merge pass
pub struct CompactionResult {
    /// Id of the merged output segment (smallest input id)
    pub new_segment_id: SegmentId,

    /// Ids of the segments that were folded in and unlinked
    pub replaced_ids: Vec<SegmentId>,
}

/// Merges the oldest sealed segments of a store into one sorted segment.
///
/// Records are folded in commit order: a later `put` overrides, a tombstone
/// removes. Because the inputs are the oldest segments, consumed tombstones
/// can be dropped entirely. The merged output takes the smallest input id and
/// is swapped in atomically (temp file, fsync, rename, then list update).
///
/// Returns `None` if there are fewer than `min_segments` sealed segments.
///
/// The active segment is never touched.
pub fn compact_segments(
    store: &SegmentStore,
    min_segments: usize,
) -> crate::Result<Option<CompactionResult>> {
    let inputs = store.sealed_segments();

    if inputs.len() < min_segments.max(2) {
        return Ok(None);
    }

    let mut merged: BTreeMap<UserKey, UserValue> = BTreeMap::new();

    // Oldest first = commit order
    for segment in &inputs {
        for item in segment.iter()? {
            let (_, record) = item?;

            match record.value {
                Some(value) => {
                    merged.insert(record.key, value);
                }
                None => {
                    merged.remove(&record.key);
                }
            }
        }
    }

    let replaced_ids = inputs.iter().map(|s| s.id).collect::<Vec<_>>();

    #[allow(clippy::expect_used)]
    let new_segment_id = *replaced_ids.iter().min().expect("at least two inputs");

    let final_path = store.segment_path(new_segment_id);

    // Stage the output under a temporary name, fsync, then rename into
    // place. A crash in between leaves the inputs intact; a crash after the
    // rename but before the unlinks is harmless because leftover inputs only
    // replay records the merged output already contains.
    let tmp_path = final_path.with_extension("seg.tmp");

    if tmp_path.exists() {
        std::fs::remove_file(&tmp_path)?;
    }

    let mut writer = SegmentWriter::create(new_segment_id, &tmp_path)?;

    for (key, value) in merged {
        writer.append(&Record::new(key, value))?;
    }

    let staged = writer.finish()?;

    std::fs::rename(&tmp_path, &final_path)?;

    let new_segment = Segment::new(new_segment_id, final_path, staged.size());

    log::debug!(
        "compacted {} segment(s) into segment {new_segment_id} ({} bytes)",
        replaced_ids.len(),
        new_segment.size(),
    );

    store.replace(&replaced_ids, new_segment)?;

    Ok(Some(CompactionResult {
        new_segment_id,
        replaced_ids,
    }))
}

/// Periodically runs compaction until shutdown is requested or the
/// callback reports that its engine is gone.
pub(crate) fn run_worker<F: Fn() -> bool + Send>(
    interval: Duration,
    shutdown: &Shutdown,
    compact: F,
) {
    while shutdown.sleep(interval) {
        if !compact() {
            return;
        }
    }
}
