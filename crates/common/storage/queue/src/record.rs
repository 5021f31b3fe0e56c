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

//! Record framing.
//!
//! Records are stored back to back after the segment header:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┬─────────────────┐
//! │  Length (4B)    │   Payload (variable) │   CRC32 (4B)    │
//! │  little-endian  │   codec output       │   little-endian │
//! └─────────────────┴──────────────────────┴─────────────────┘
//! ```
//!
//! A record is valid iff its length prefix fits in the remaining file and the
//! stored CRC matches the payload.

use bytes::{BufMut, Bytes, BytesMut};
use snafu::OptionExt;

use crate::{Result, crc::payload_crc, error::PayloadTooLargeSnafu};

/// Size of the length prefix in bytes (4 bytes = u32).
pub(crate) const RECORD_LENGTH_SIZE: usize = 4;

/// Size of the CRC32 checksum in bytes.
pub(crate) const RECORD_CRC_SIZE: usize = 4;

/// Total on-disk size of a record with the given payload length.
#[inline]
pub(crate) const fn record_disk_size(payload_len: usize) -> u64 {
    (RECORD_LENGTH_SIZE + payload_len + RECORD_CRC_SIZE) as u64
}

/// Length prefix for a payload of `len` bytes.
///
/// Fails with `PayloadTooLarge` when `len` does not fit in a `u32`.
pub(crate) fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).ok().context(PayloadTooLargeSnafu { len })
}

/// Builds the full on-disk frame for `payload` so it can be written with a
/// single `write_all`.
pub(crate) fn frame_record(payload: &[u8]) -> Result<Bytes> {
    let len = length_prefix(payload.len())?;
    let mut buf = BytesMut::with_capacity(RECORD_LENGTH_SIZE + payload.len() + RECORD_CRC_SIZE);
    buf.put_u32_le(len);
    buf.put_slice(payload);
    buf.put_u32_le(payload_crc(payload));
    Ok(buf.freeze())
}

/// Result of parsing one record at an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A valid record. `next` is the offset just past its CRC.
    Record { payload: Bytes, next: u64 },
    /// No complete record starts at the offset.
    Eof,
    /// The bytes at the offset are not a valid record.
    Corrupt { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QueueError, crc::verify_payload_crc};

    #[test]
    fn test_record_disk_size() {
        assert_eq!(record_disk_size(0), 8);
        assert_eq!(record_disk_size(10), 18);
        assert_eq!(record_disk_size(100), 108);
    }

    #[test]
    fn test_frame_layout() {
        let frame = frame_record(b"hello").unwrap();
        assert_eq!(frame.len() as u64, record_disk_size(5));
        assert_eq!(&frame[..4], &5u32.to_le_bytes());
        assert_eq!(&frame[4..9], b"hello");

        let crc = u32::from_le_bytes(frame[9..13].try_into().unwrap());
        assert!(verify_payload_crc(b"hello", crc));
    }

    #[test]
    fn test_length_prefix_accepts_u32_max() {
        assert_eq!(length_prefix(0).unwrap(), 0);
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_length_prefix_rejects_oversized_payload() {
        let len = u32::MAX as usize + 1;
        assert!(matches!(
            length_prefix(len),
            Err(QueueError::PayloadTooLarge { len: l }) if l == len
        ));
    }
}
