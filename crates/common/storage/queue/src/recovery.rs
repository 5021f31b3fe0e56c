// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Crash recovery for the spool directory.
//!
//! Runs after the directory lock is held:
//! 1. Open the segment set; the last segment gets its torn tail truncated
//! 2. Load the cursor, falling back to the oldest segment if it is missing,
//!    unreadable or points at a segment that no longer exists
//! 3. Delete segments wholly below the cursor (left over if a crash hit
//!    between a cursor store and garbage collection)
//! 4. Count the records between the cursor and the end of the log

use tracing::{info, warn};

use crate::{
    QueueConfig, Result,
    cursor::{Cursor, CursorStore},
    error::CorruptSegmentSnafu,
    segment::SEGMENT_HEADER_SIZE,
    segment_set::SegmentSet,
};

/// State recovered from disk.
#[derive(Debug)]
pub(crate) struct RecoveredState {
    pub segments: SegmentSet,
    pub cursor:   Cursor,
    /// Number of unconsumed records after the cursor.
    pub pending:  u64,
}

pub(crate) fn recover(config: &QueueConfig, store: &CursorStore) -> Result<RecoveredState> {
    info!(path = ?config.spool_path, "Starting queue recovery");

    let mut segments = SegmentSet::open(&config.spool_path, config.segment_max_bytes)?;
    let cursor = resolve_cursor(&segments, store.load()?);

    let removed = segments.gc(cursor.segment_id)?;
    if !removed.is_empty() {
        warn!(segments = ?removed, "Removed segments left behind below the cursor");
    }

    let pending = count_pending(&mut segments, cursor)?;

    info!(
        read_segment_id = cursor.segment_id,
        read_offset = cursor.offset,
        write_segment_id = segments.active_id(),
        pending,
        "Queue recovery complete"
    );

    Ok(RecoveredState {
        segments,
        cursor,
        pending,
    })
}

/// Clamps a loaded cursor onto the segments actually present.
fn resolve_cursor(segments: &SegmentSet, loaded: Option<Cursor>) -> Cursor {
    let oldest = Cursor::new(segments.first_id(), SEGMENT_HEADER_SIZE);

    let Some(cursor) = loaded else {
        info!(segment_id = oldest.segment_id, "No cursor found, reading from oldest segment");
        return oldest;
    };

    if cursor.segment_id > segments.active_id() || !segments.contains(cursor.segment_id) {
        warn!(
            segment_id = cursor.segment_id,
            offset = cursor.offset,
            oldest = oldest.segment_id,
            "Cursor refers to a missing segment, reading from oldest segment"
        );
        return oldest;
    }

    let size = segments
        .segment_size(cursor.segment_id)
        .unwrap_or(SEGMENT_HEADER_SIZE);
    if cursor.offset < SEGMENT_HEADER_SIZE {
        return Cursor::new(cursor.segment_id, SEGMENT_HEADER_SIZE);
    }
    if cursor.offset > size {
        // Only possible when unsynced appends were lost in the crash.
        warn!(
            segment_id = cursor.segment_id,
            offset = cursor.offset,
            size,
            "Cursor is past the end of its segment, clamping"
        );
        return Cursor::new(cursor.segment_id, size);
    }

    cursor
}

/// Counts valid records from `cursor` to the end of the log.
///
/// The active segment has already had its tail repaired, so an invalid record
/// anywhere in the range is mid-stream corruption.
fn count_pending(segments: &mut SegmentSet, cursor: Cursor) -> Result<u64> {
    let mut pending = 0;

    for id in segments.ids() {
        if id < cursor.segment_id {
            continue;
        }
        let start = if id == cursor.segment_id {
            cursor.offset
        } else {
            SEGMENT_HEADER_SIZE
        };

        let segment = segments.read_segment(id)?;
        let summary = segment.scan_from(start)?;
        if let Some(reason) = summary.invalid {
            return CorruptSegmentSnafu {
                segment_id: id,
                offset: summary.end,
                reason,
            }
            .fail();
        }
        pending += summary.records;
    }

    Ok(pending)
}
