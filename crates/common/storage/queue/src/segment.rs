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

//! Append-only segment files.
//!
//! ## Header Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (30 bytes, little-endian)                         │
//! ├──────────────────┬───────────────────────────────────────┤
//! │ magic: u32       │ 0x5355524F ("SURO")                    │
//! │ version: u16     │ Format version, currently 1            │
//! │ segment_id: u64  │ Matches the id in the file name        │
//! │ created_ms: u64  │ Unix millis at creation                │
//! │ reserved: [u8;4] │ Zero                                   │
//! │ header_crc: u32  │ CRC32 of the preceding 26 bytes        │
//! └──────────────────┴───────────────────────────────────────┘
//! ```
//!
//! Records (`len | payload | crc32`) follow the header. Records are appended in
//! arrival order and never rewritten; the only mutation of existing bytes is
//! truncation of a torn tail during recovery.

use std::{
    fs::{File, OpenOptions},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use chrono::Utc;
use snafu::ensure;
use tracing::{debug, info, warn};

use crate::{
    Result,
    crc::{block_crc, verify_payload_crc},
    error::CorruptSegmentSnafu,
    path::sync_dir,
    record::{RECORD_CRC_SIZE, RECORD_LENGTH_SIZE, ReadOutcome, frame_record, record_disk_size},
};

/// Magic number identifying a segment file: "SURO".
pub const SEGMENT_MAGIC: u32 = 0x5355_524F;

/// Current segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Size of the segment header in bytes. The first record starts here.
pub const SEGMENT_HEADER_SIZE: u64 = 30;

const HEADER_CRC_OFFSET: usize = 26;

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version:    u16,
    pub segment_id: u64,
    pub created_ms: u64,
}

impl SegmentHeader {
    pub fn new(segment_id: u64) -> Self {
        Self {
            version: SEGMENT_VERSION,
            segment_id,
            created_ms: u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default(),
        }
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..14].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[14..22].copy_from_slice(&self.created_ms.to_le_bytes());
        let crc = block_crc(&buf[..HEADER_CRC_OFFSET]);
        buf[HEADER_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses and validates a header. Returns the reason on failure.
    pub fn decode(buf: &[u8; SEGMENT_HEADER_SIZE as usize]) -> std::result::Result<Self, String> {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != SEGMENT_MAGIC {
            return Err(format!("bad magic {magic:#010x}"));
        }

        let stored_crc = u32::from_le_bytes([buf[26], buf[27], buf[28], buf[29]]);
        if block_crc(&buf[..HEADER_CRC_OFFSET]) != stored_crc {
            return Err("header checksum mismatch".to_string());
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != SEGMENT_VERSION {
            return Err(format!("unsupported version {version}"));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[6..14]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&buf[14..22]);

        Ok(Self {
            version,
            segment_id: u64::from_le_bytes(id),
            created_ms: u64::from_le_bytes(created),
        })
    }
}

/// Outcome of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// The record was written between `offset` and `next`.
    Written { offset: u64, next: u64 },
    /// The record does not fit under the size cap; the caller should roll.
    Full,
}

/// Summary of a forward validation scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Number of valid records found.
    pub records: u64,
    /// Offset just past the last valid record.
    pub end:     u64,
    /// Why the scan stopped before the end of the file, if it did.
    pub invalid: Option<String>,
}

/// An append-only segment file.
///
/// The queue serializes every access under its monitor lock, so a segment
/// uses plain seek + read/write on a single handle.
#[derive(Debug)]
pub struct Segment {
    id:      u64,
    path:    PathBuf,
    file:    File,
    header:  SegmentHeader,
    size:    u64,
    sealed:  bool,
    /// Size the segment may grow to before appends report [`Append::Full`].
    max_len: u64,
}

impl Segment {
    /// Creates or opens a segment for appending.
    ///
    /// A new (or torn, shorter than a header) file gets a fresh header that is
    /// fsynced before returning. An existing file has its header validated
    /// and any trailing partial or corrupt bytes truncated.
    pub fn open_for_append<P: AsRef<Path>>(path: P, id: u64, max_len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();

        let header = if len < SEGMENT_HEADER_SIZE {
            if len > 0 {
                warn!(segment_id = id, len, "Rewriting torn segment header");
            }
            let header = SegmentHeader::new(id);
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.encode())?;
            file.sync_all()?;
            if let Some(parent) = path.parent() {
                sync_dir(parent)?;
            }
            debug!(segment_id = id, path = ?path, "Created segment");
            header
        } else {
            let header = read_header(&mut file, id)?;
            ensure!(header.segment_id == id, CorruptSegmentSnafu {
                segment_id: id,
                offset:     0u64,
                reason:     format!("header carries segment id {}", header.segment_id),
            });
            header
        };

        let size = file.metadata()?.len();
        let mut segment = Self {
            id,
            path,
            file,
            header,
            size,
            sealed: false,
            max_len,
        };
        segment.recover_tail()?;
        Ok(segment)
    }

    /// Opens an existing segment read-only, positioned at the first record.
    ///
    /// Segments opened this way are sealed: they are never appended to.
    pub fn open_for_read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();
        let id = crate::path::parse_segment_id(
            path.file_name().and_then(|s| s.to_str()).unwrap_or_default(),
        )
        .unwrap_or_default();

        ensure!(size >= SEGMENT_HEADER_SIZE, CorruptSegmentSnafu {
            segment_id: id,
            offset:     size,
            reason:     "file shorter than segment header",
        });
        let header = read_header(&mut file, id)?;

        Ok(Self {
            id: header.segment_id,
            path,
            file,
            header,
            size,
            sealed: true,
            max_len: size,
        })
    }

    /// Appends one record carrying `payload`.
    ///
    /// Returns [`Append::Full`] if the segment is sealed, or if the record
    /// would push it past its size cap. An empty segment accepts any single
    /// record so that oversized payloads still make progress after a roll.
    pub fn append(&mut self, payload: &[u8]) -> Result<Append> {
        let record_len = record_disk_size(payload.len());
        if self.sealed || (!self.is_empty() && self.size + record_len > self.max_len) {
            return Ok(Append::Full);
        }

        let offset = self.size;
        let frame = frame_record(payload)?;

        self.file.seek(SeekFrom::Start(offset))?;
        if let Err(e) = self.file.write_all(&frame) {
            // Drop whatever made it to the file so the next append starts on a
            // record boundary.
            if let Err(trunc) = self.file.set_len(offset) {
                warn!(segment_id = self.id, offset, error = ?trunc, "Failed to roll back partial record");
            }
            return Err(e.into());
        }

        self.size = offset + record_len;
        Ok(Append::Written {
            offset,
            next: self.size,
        })
    }

    /// Parses the record starting at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<ReadOutcome> {
        if offset == self.size {
            return Ok(ReadOutcome::Eof);
        }
        if offset > self.size || offset < SEGMENT_HEADER_SIZE {
            return Ok(ReadOutcome::Corrupt {
                reason: format!("offset {offset} outside segment of {} bytes", self.size),
            });
        }

        let remaining = self.size - offset;
        if remaining < (RECORD_LENGTH_SIZE + RECORD_CRC_SIZE) as u64 {
            return Ok(ReadOutcome::Corrupt {
                reason: format!("{remaining} trailing bytes cannot hold a record"),
            });
        }

        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(offset))?;
        read_record(&mut reader, offset, remaining)
    }

    /// Validates records forward from `offset`, stopping at the first invalid
    /// one or at the end of the file.
    pub fn scan_from(&self, offset: u64) -> Result<ScanSummary> {
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(offset))?;

        let mut position = offset;
        let mut records = 0u64;
        let mut invalid = None;

        while position < self.size {
            match read_record(&mut reader, position, self.size - position)? {
                ReadOutcome::Record { next, .. } => {
                    position = next;
                    records += 1;
                }
                ReadOutcome::Eof => break,
                ReadOutcome::Corrupt { reason } => {
                    invalid = Some(reason);
                    break;
                }
            }
        }

        Ok(ScanSummary {
            records,
            end: position,
            invalid,
        })
    }

    /// Truncates trailing bytes that do not form a valid record.
    ///
    /// Only a torn tail is cut: fewer bytes than a record frame, a length
    /// prefix running past the end of the file, or a bad last record ending
    /// exactly at the end of the file. An invalid record with more bytes
    /// behind it is mid-stream corruption and fails with `CorruptSegment`,
    /// leaving the file untouched.
    ///
    /// Returns the number of bytes removed.
    pub fn recover_tail(&mut self) -> Result<u64> {
        let summary = self.scan_from(SEGMENT_HEADER_SIZE)?;
        if summary.end == self.size {
            return Ok(0);
        }

        let remaining = self.size - summary.end;
        if remaining >= (RECORD_LENGTH_SIZE + RECORD_CRC_SIZE) as u64 {
            let frame_end = summary.end + record_disk_size(self.length_prefix_at(summary.end)?);
            ensure!(frame_end >= self.size, CorruptSegmentSnafu {
                segment_id: self.id,
                offset:     summary.end,
                reason:     format!(
                    "{}; {} bytes follow the bad record",
                    summary.invalid.as_deref().unwrap_or("invalid record"),
                    self.size - frame_end
                ),
            });
        }

        let removed = self.size - summary.end;
        warn!(
            segment_id = self.id,
            valid_end = summary.end,
            removed,
            reason = summary.invalid.as_deref().unwrap_or("partial record"),
            "Truncating torn segment tail"
        );
        self.truncate(summary.end)?;
        Ok(removed)
    }

    fn length_prefix_at(&self, offset: u64) -> Result<usize> {
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(offset))?;
        let mut length_buf = [0u8; RECORD_LENGTH_SIZE];
        reader.read_exact(&mut length_buf)?;
        Ok(u32::from_le_bytes(length_buf) as usize)
    }

    /// Cuts the segment back to `len` bytes and fsyncs the result.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.size = len;
        Ok(())
    }

    /// Flushes appended records to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Marks the segment immutable and fsyncs it.
    pub fn seal(&mut self) -> Result<()> {
        if !self.sealed {
            self.file.sync_all()?;
            self.sealed = true;
            info!(segment_id = self.id, size = self.size, "Sealed segment");
        }
        Ok(())
    }

    pub fn id(&self) -> u64 { self.id }

    pub fn path(&self) -> &Path { &self.path }

    pub fn header(&self) -> &SegmentHeader { &self.header }

    pub fn size(&self) -> u64 { self.size }

    pub fn is_sealed(&self) -> bool { self.sealed }

    /// Returns `true` if the segment holds no records.
    pub fn is_empty(&self) -> bool { self.size <= SEGMENT_HEADER_SIZE }
}

fn read_header(file: &mut File, id: u64) -> Result<SegmentHeader> {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    SegmentHeader::decode(&buf).map_err(|reason| {
        CorruptSegmentSnafu {
            segment_id: id,
            offset: 0u64,
            reason,
        }
        .build()
    })
}

/// Reads one record from `reader`, which must be positioned at `offset`.
///
/// `remaining` is the number of bytes between `offset` and the end of file.
fn read_record<R: Read>(reader: &mut R, offset: u64, remaining: u64) -> Result<ReadOutcome> {
    if remaining == 0 {
        return Ok(ReadOutcome::Eof);
    }
    if remaining < RECORD_LENGTH_SIZE as u64 {
        return Ok(ReadOutcome::Corrupt {
            reason: "truncated length prefix".to_string(),
        });
    }

    let mut length_buf = [0u8; RECORD_LENGTH_SIZE];
    reader.read_exact(&mut length_buf)?;
    let length = u32::from_le_bytes(length_buf) as usize;

    let total = record_disk_size(length);
    if total > remaining {
        return Ok(ReadOutcome::Corrupt {
            reason: format!("length prefix {length} overruns file ({remaining} bytes left)"),
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    let mut crc_buf = [0u8; RECORD_CRC_SIZE];
    reader.read_exact(&mut crc_buf)?;
    if !verify_payload_crc(&payload, u32::from_le_bytes(crc_buf)) {
        return Ok(ReadOutcome::Corrupt {
            reason: format!("checksum mismatch for record at offset {offset}"),
        });
    }

    Ok(ReadOutcome::Record {
        payload: Bytes::from(payload),
        next:    offset + total,
    })
}
