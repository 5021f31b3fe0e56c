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

use std::{io, path::PathBuf};

use snafu::Snafu;

use crate::codec::CodecError;

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error"), context(false))]
    Io {
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The spool directory is owned by another queue handle.
    #[snafu(display("Spool directory {} is locked by another queue", path.display()))]
    Locked { path: PathBuf },

    /// Unrecoverable corruption inside a segment.
    #[snafu(display("Corrupt segment {segment_id} at offset {offset}: {reason}"))]
    CorruptSegment {
        segment_id: u64,
        offset:     u64,
        reason:     String,
    },

    /// A stored payload could not be decoded. The record has been skipped.
    #[snafu(display("Failed to decode payload"), context(false))]
    Codec { source: CodecError },

    /// Appending would exceed the configured disk budget.
    #[snafu(display("Disk budget exhausted: {required} bytes required, limit is {limit}"))]
    DiskFull { required: u64, limit: u64 },

    /// A blocking wait was interrupted.
    #[snafu(display("Blocking wait interrupted"))]
    Interrupted,

    /// The queue has been closed.
    #[snafu(display("Queue is closed"))]
    Closed,

    /// Configuration rejected by validation.
    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    /// Invalid or inaccessible file path.
    #[snafu(display("Invalid file path: {}", path.display()))]
    InvalidPath { path: PathBuf },

    /// Payload does not fit the 32-bit record length prefix.
    #[snafu(display("Payload of {len} bytes exceeds the record length limit"))]
    PayloadTooLarge { len: usize },
}

impl QueueError {
    /// Returns `true` when the underlying cause is the filesystem running out
    /// of space.
    pub(crate) fn is_out_of_space(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::StorageFull)
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
