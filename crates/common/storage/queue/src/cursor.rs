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

//! Durable read cursor.
//!
//! ## Binary Format
//!
//! ```text
//! ┌─────────────────┬─────────────────┬─────────────────┐
//! │ segment_id: u64 │ offset: u64     │ crc32: u32      │
//! └─────────────────┴─────────────────┴─────────────────┘
//! ```
//!
//! All fields are little-endian; the CRC covers the first 16 bytes. The file
//! is replaced atomically: write `cursor.dat.tmp`, fsync, rename over
//! `cursor.dat`, fsync the directory.

use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    Result,
    crc::block_crc,
    path::{CURSOR_FILE, CURSOR_TMP_FILE, sync_dir},
};

/// Size of the cursor file in bytes.
pub const CURSOR_FILE_SIZE: usize = 20;

/// A position in the segment log: the next byte to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub segment_id: u64,
    pub offset:     u64,
}

impl Cursor {
    pub const fn new(segment_id: u64, offset: u64) -> Self { Self { segment_id, offset } }

    pub fn encode(&self) -> [u8; CURSOR_FILE_SIZE] {
        let mut buf = [0u8; CURSOR_FILE_SIZE];
        buf[0..8].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        let crc = block_crc(&buf[..16]);
        buf[16..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a cursor, returning `None` if the checksum does not match.
    pub fn decode(buf: &[u8; CURSOR_FILE_SIZE]) -> Option<Self> {
        let stored = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if block_crc(&buf[..16]) != stored {
            return None;
        }

        let mut segment_id = [0u8; 8];
        segment_id.copy_from_slice(&buf[0..8]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[8..16]);
        Some(Self::new(
            u64::from_le_bytes(segment_id),
            u64::from_le_bytes(offset),
        ))
    }
}

/// Persists the cursor under a spool directory.
#[derive(Debug)]
pub(crate) struct CursorStore {
    base_path: PathBuf,
}

impl CursorStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Loads the stored cursor.
    ///
    /// Returns `Ok(None)` if the file is absent, short or fails its checksum;
    /// the caller then starts from the oldest segment.
    pub fn load(&self) -> Result<Option<Cursor>> {
        let path = self.base_path.join(CURSOR_FILE);

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut buf = [0u8; CURSOR_FILE_SIZE];
        if let Err(e) = file.read_exact(&mut buf) {
            if e.kind() == ErrorKind::UnexpectedEof {
                warn!(path = ?path, "Cursor file is short, ignoring it");
                return Ok(None);
            }
            return Err(e.into());
        }

        let cursor = Cursor::decode(&buf);
        if cursor.is_none() {
            warn!(path = ?path, "Cursor checksum mismatch, ignoring it");
        }
        Ok(cursor)
    }

    /// Durably replaces the stored cursor.
    ///
    /// Once this returns `Ok`, the new cursor survives a crash.
    pub fn store(&self, cursor: Cursor) -> Result<()> {
        let tmp_path = self.base_path.join(CURSOR_TMP_FILE);
        let path = self.base_path.join(CURSOR_FILE);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&cursor.encode())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &path)?;
        sync_dir(&self.base_path)?;

        debug!(
            segment_id = cursor.segment_id,
            offset = cursor.offset,
            "Cursor stored"
        );
        Ok(())
    }
}
