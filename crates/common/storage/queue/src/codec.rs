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

//! Payload codecs.
//!
//! A [`Codec`] turns a typed value into the payload bytes stored inside a
//! record and back. Codecs never see framing: the length prefix and checksum
//! are added by the segment layer.

use std::string::FromUtf8Error;

use bytes::Bytes;
use snafu::Snafu;

/// Payload decode failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    /// Payload is not valid UTF-8.
    #[snafu(display("Payload is not valid UTF-8"))]
    InvalidUtf8 { source: FromUtf8Error },

    /// Payload bytes do not describe a value of the target type.
    #[snafu(display("Malformed payload: {reason}"))]
    Malformed { reason: String },
}

/// Converts values to and from record payloads.
///
/// `encode` must be total and deterministic, and `decode(encode(v))` must
/// yield a value equal to `v`.
pub trait Codec: Send + Sync + 'static {
    type Item;

    fn encode(&self, item: &Self::Item) -> Bytes;

    fn decode(&self, payload: &[u8]) -> Result<Self::Item, CodecError>;
}

/// UTF-8 string payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Item = String;

    fn encode(&self, item: &String) -> Bytes { Bytes::copy_from_slice(item.as_bytes()) }

    fn decode(&self, payload: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(payload.to_vec()).map_err(|source| CodecError::InvalidUtf8 { source })
    }
}

/// Raw byte payloads, stored as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Item = Bytes;

    fn encode(&self, item: &Bytes) -> Bytes { item.clone() }

    fn decode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("" ; "empty")]
    #[test_case("testString0" ; "ascii")]
    #[test_case("h\u{e9}llo w\u{f6}rld \u{1f680}" ; "multibyte")]
    fn test_string_codec_round_trip(value: &str) {
        let codec = StringCodec;
        let encoded = codec.encode(&value.to_string());
        assert_eq!(encoded.as_ref(), value.as_bytes());
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        let err = StringCodec.decode(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidUtf8 { .. }));
    }

    #[test]
    fn test_bytes_codec_is_identity() {
        let payload = Bytes::from_static(&[0, 1, 2, 0xff]);
        let encoded = BytesCodec.encode(&payload);
        assert_eq!(encoded, payload);
        assert_eq!(BytesCodec.decode(&encoded).unwrap(), payload);
    }
}
