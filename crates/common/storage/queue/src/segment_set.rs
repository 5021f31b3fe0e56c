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

//! The ordered set of segment files under a spool directory.
//!
//! Exactly one segment, the one with the highest id, is open for append.
//! Every lower segment is sealed and immutable; its read handle is opened
//! lazily and cached until the segment is garbage collected.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use snafu::{OptionExt, ensure};
use tracing::{debug, info};

use crate::{
    Result,
    error::CorruptSegmentSnafu,
    path::{scan_segments, segment_path, sync_dir},
    segment::Segment,
};

#[derive(Debug)]
struct SealedSegment {
    path:   PathBuf,
    size:   u64,
    reader: Option<Segment>,
}

/// Ordered collection of live segments.
#[derive(Debug)]
pub struct SegmentSet {
    base_path:    PathBuf,
    max_segment:  u64,
    active:       Segment,
    sealed:       BTreeMap<u64, SealedSegment>,
    /// Sum of the sizes of all sealed segments.
    sealed_bytes: u64,
}

impl SegmentSet {
    /// Scans `base_path` and opens the highest segment for append, creating
    /// segment 0 if the directory holds none.
    ///
    /// Fails with `CorruptSegment` if the ids on disk are not contiguous.
    pub fn open<P: AsRef<Path>>(base_path: P, max_segment: u64) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        let mut found = scan_segments(&base_path)?;

        for pair in found.windows(2) {
            let (prev, next) = (pair[0].0, pair[1].0);
            ensure!(next == prev + 1, CorruptSegmentSnafu {
                segment_id: prev + 1,
                offset:     0u64,
                reason:     format!("segment missing between {prev} and {next}"),
            });
        }

        let active = match found.pop() {
            Some((id, path)) => Segment::open_for_append(path, id, max_segment)?,
            None => {
                info!(path = ?base_path, "No segments found, creating segment 0");
                Segment::open_for_append(segment_path(&base_path, 0), 0, max_segment)?
            }
        };

        let mut sealed = BTreeMap::new();
        let mut sealed_bytes = 0;

        // An empty last segment may have been created by a roll whose
        // predecessor never reached disk in full; repair that one's tail too.
        let previous = if active.is_empty() { found.pop() } else { None };
        let repaired = match previous {
            Some((id, path)) => {
                let mut previous = Segment::open_for_append(path, id, max_segment)?;
                previous.seal()?;
                Some(previous)
            }
            None => None,
        };

        for (id, path) in found {
            let size = std::fs::metadata(&path)?.len();
            sealed_bytes += size;
            sealed.insert(id, SealedSegment {
                path,
                size,
                reader: None,
            });
        }
        if let Some(previous) = repaired {
            let size = previous.size();
            sealed_bytes += size;
            sealed.insert(previous.id(), SealedSegment {
                path: previous.path().to_path_buf(),
                size,
                reader: Some(previous),
            });
        }

        debug!(
            path = ?base_path,
            active = active.id(),
            sealed = sealed.len(),
            "Segment set opened"
        );

        Ok(Self {
            base_path,
            max_segment,
            active,
            sealed,
            sealed_bytes,
        })
    }

    /// The highest-id segment, open for append.
    pub fn active_write_segment(&mut self) -> &mut Segment { &mut self.active }

    pub fn active_id(&self) -> u64 { self.active.id() }

    /// Lowest segment id still on disk.
    pub fn first_id(&self) -> u64 {
        self.sealed
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.active.id())
    }

    pub fn contains(&self, id: u64) -> bool { id == self.active.id() || self.sealed.contains_key(&id) }

    /// Returns `true` if `id` is below the active segment, so nothing will
    /// ever be appended to it again.
    pub fn is_sealed(&self, id: u64) -> bool { id < self.active.id() }

    /// Current size of segment `id`, if it exists.
    pub fn segment_size(&self, id: u64) -> Option<u64> {
        if id == self.active.id() {
            Some(self.active.size())
        } else {
            self.sealed.get(&id).map(|s| s.size)
        }
    }

    /// Segment `id` opened for reading. Sealed segments are opened on first
    /// use and the handle is kept until the segment is collected.
    pub fn read_segment(&mut self, id: u64) -> Result<&Segment> {
        if id == self.active.id() {
            return Ok(&self.active);
        }

        let entry = self.sealed.get_mut(&id).context(CorruptSegmentSnafu {
            segment_id: id,
            offset:     0u64,
            reason:     "segment not present on disk",
        })?;

        if entry.reader.is_none() {
            let segment = Segment::open_for_read(&entry.path)?;
            ensure!(segment.id() == id, CorruptSegmentSnafu {
                segment_id: id,
                offset:     0u64,
                reason:     format!("header carries segment id {}", segment.id()),
            });
            debug!(segment_id = id, "Opened sealed segment for read");
            entry.reader = Some(segment);
        }

        entry.reader.as_ref().context(CorruptSegmentSnafu {
            segment_id: id,
            offset:     0u64,
            reason:     "segment reader unavailable",
        })
    }

    /// Seals the active segment and opens `id + 1` as the new active one.
    ///
    /// The active segment is fsynced before the next file exists, so a crash
    /// mid-roll never leaves an unsynced segment below an empty one. If
    /// creating the next segment fails, the sealed segment stays active and
    /// keeps refusing appends until a later roll succeeds.
    ///
    /// Returns the id of the new active segment. The caller must hold the
    /// queue's monitor lock.
    pub fn roll(&mut self) -> Result<u64> {
        self.active.seal()?;

        let next_id = self.active.id() + 1;
        let next = Segment::open_for_append(
            segment_path(&self.base_path, next_id),
            next_id,
            self.max_segment,
        )?;
        let previous = std::mem::replace(&mut self.active, next);
        let size = previous.size();
        self.sealed_bytes += size;
        self.sealed.insert(previous.id(), SealedSegment {
            path: previous.path().to_path_buf(),
            size,
            reader: Some(previous),
        });

        info!(segment_id = next_id, "Rolled to new segment");
        Ok(next_id)
    }

    /// Deletes every segment with id strictly below `up_to_id`.
    ///
    /// The active segment is never deleted. Returns the ids removed.
    pub fn gc(&mut self, up_to_id: u64) -> Result<Vec<u64>> {
        let limit = up_to_id.min(self.active.id());
        let doomed: Vec<u64> = self.sealed.range(..limit).map(|(id, _)| *id).collect();

        for id in &doomed {
            if let Some(entry) = self.sealed.remove(id) {
                drop(entry.reader);
                match std::fs::remove_file(&entry.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        // Put it back so accounting stays consistent with disk.
                        self.sealed.insert(*id, SealedSegment {
                            path:   entry.path,
                            size:   entry.size,
                            reader: None,
                        });
                        return Err(e.into());
                    }
                }
                self.sealed_bytes -= entry.size;
            }
        }

        if !doomed.is_empty() {
            sync_dir(&self.base_path)?;
            info!(segments = ?doomed, "Deleted consumed segments");
        }

        Ok(doomed)
    }

    /// Total bytes of all live segments.
    pub fn disk_bytes(&self) -> u64 { self.sealed_bytes + self.active.size() }

    pub fn segment_count(&self) -> usize { self.sealed.len() + 1 }

    /// Ids of all live segments, ascending.
    pub fn ids(&self) -> Vec<u64> {
        self.sealed
            .keys()
            .copied()
            .chain(std::iter::once(self.active.id()))
            .collect()
    }
}
