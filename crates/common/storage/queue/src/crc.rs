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

//! CRC32 checksum utilities.
//!
//! Uses CRC-32 (IEEE polynomial) via crc32fast. Three things are checksummed:
//! record payloads, segment headers and the cursor file body. A record CRC
//! covers only the payload; a torn length prefix is caught by the bounds
//! check against the file size.

/// Checksum of a record payload.
#[inline]
pub(crate) fn payload_crc(payload: &[u8]) -> u32 { crc32fast::hash(payload) }

/// Verifies a record payload against its stored checksum.
#[inline]
pub(crate) fn verify_payload_crc(payload: &[u8], expected: u32) -> bool {
    payload_crc(payload) == expected
}

/// Checksum over an arbitrary fixed-layout block (segment header, cursor).
#[inline]
pub(crate) fn block_crc(block: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(block);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_crc_is_deterministic() {
        let data = b"test message";
        assert_eq!(payload_crc(data), payload_crc(data));
        assert_ne!(payload_crc(data), payload_crc(b"test messagf"));
    }

    #[test]
    fn test_verify_payload_crc() {
        let data = b"message to verify";
        let crc = payload_crc(data);

        assert!(verify_payload_crc(data, crc));
        assert!(!verify_payload_crc(data, crc.wrapping_add(1)));
        assert!(!verify_payload_crc(b"wrong", crc));
    }

    #[test]
    fn test_block_crc_matches_one_shot_hash() {
        let block = [7u8; 16];
        assert_eq!(block_crc(&block), crc32fast::hash(&block));
    }
}
