//! Value codec shared by both cache tiers.
//!
//! The memory tier holds bare [`Payload`]s; the remote tier holds sealed
//! envelopes, a one-byte header followed by the (possibly compressed) payload:
//!
//! ```text
//! bit 7      : payload is gzip-compressed
//! bits 4..=6 : reserved, must be zero
//! bits 0..=3 : encoding tag (0 = JSON, 1 = MessagePack)
//! ```

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Payloads larger than this many bytes are compressed before sealing.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

const FLAG_COMPRESSED: u8 = 0b1000_0000;
const ENCODING_MASK: u8 = 0b0000_1111;
const RESERVED_MASK: u8 = 0b0111_0000;

/// Structured encoding used for cached values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Encoding {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "msgpack", alias = "messagepack")]
    MessagePack,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Json => 0,
            Self::MessagePack => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Json),
            1 => Some(Self::MessagePack),
            _ => None,
        }
    }
}

/// A serialized value without envelope or compression.
///
/// Its length is what the memory tier charges against its byte budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    encoding: Encoding,
    bytes: Bytes,
}

impl Payload {
    pub fn new(encoding: Encoding, bytes: impl Into<Bytes>) -> Self {
        Self {
            encoding,
            bytes: bytes.into(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self.encoding {
            Encoding::Json => {
                serde_json::from_slice(&self.bytes).map_err(|err| CodecError::Decode {
                    encoding: self.encoding.as_str(),
                    reason: err.to_string(),
                })
            }
            Encoding::MessagePack => {
                rmp_serde::from_slice(&self.bytes).map_err(|err| CodecError::Decode {
                    encoding: self.encoding.as_str(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode value as {encoding}: {reason}")]
    Encode {
        encoding: &'static str,
        reason: String,
    },
    #[error("failed to compress payload: {0}")]
    Compress(#[source] io::Error),
    #[error("envelope is empty")]
    Empty,
    #[error("unknown encoding tag {0:#04x}")]
    UnknownEncoding(u8),
    #[error("envelope header {0:#04x} sets reserved bits")]
    ReservedBits(u8),
    #[error("failed to decompress payload: {0}")]
    Decompress(#[source] io::Error),
    #[error("failed to decode {encoding} payload: {reason}")]
    Decode {
        encoding: &'static str,
        reason: String,
    },
}

impl CodecError {
    /// True for failures reading a stored value back, which callers treat as a miss.
    pub fn is_deserialization(&self) -> bool {
        matches!(
            self,
            Self::Empty
                | Self::UnknownEncoding(_)
                | Self::ReservedBits(_)
                | Self::Decompress(_)
                | Self::Decode { .. }
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    encoding: Encoding,
    compression_threshold: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Encoding::default())
    }
}

impl Codec {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encode a value and seal it into a remote-tier envelope.
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode(value)?;
        self.seal(&payload)
    }

    /// Open an envelope and decode the value it carries.
    pub fn deserialize<T: DeserializeOwned>(&self, envelope: &[u8]) -> Result<T, CodecError> {
        self.open(envelope)?.decode()
    }

    /// Encode a value with this codec's encoding, without envelope.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Payload, CodecError> {
        let bytes = match self.encoding {
            Encoding::Json => serde_json::to_vec(value).map_err(|err| err.to_string()),
            Encoding::MessagePack => rmp_serde::to_vec_named(value).map_err(|err| err.to_string()),
        }
        .map_err(|reason| CodecError::Encode {
            encoding: self.encoding.as_str(),
            reason,
        })?;

        Ok(Payload::new(self.encoding, bytes))
    }

    /// Wrap a payload in an envelope, compressing it above the threshold.
    pub fn seal(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let mut header = payload.encoding().tag();

        if payload.len() <= self.compression_threshold {
            let mut envelope = Vec::with_capacity(payload.len() + 1);
            envelope.push(header);
            envelope.extend_from_slice(payload.as_bytes());
            return Ok(envelope);
        }

        header |= FLAG_COMPRESSED;
        let mut encoder = GzEncoder::new(vec![header], Compression::default());
        encoder
            .write_all(payload.as_bytes())
            .map_err(CodecError::Compress)?;
        encoder.finish().map_err(CodecError::Compress)
    }

    /// Read an envelope header and recover the bare payload.
    ///
    /// The encoding comes from the header, so envelopes written by an
    /// instance configured with another encoding still decode.
    pub fn open(&self, envelope: &[u8]) -> Result<Payload, CodecError> {
        let (&header, body) = envelope.split_first().ok_or(CodecError::Empty)?;
        if header & RESERVED_MASK != 0 {
            return Err(CodecError::ReservedBits(header));
        }

        let tag = header & ENCODING_MASK;
        let encoding = Encoding::from_tag(tag).ok_or(CodecError::UnknownEncoding(tag))?;

        if header & FLAG_COMPRESSED == 0 {
            return Ok(Payload::new(encoding, body.to_vec()));
        }

        let mut bytes = Vec::with_capacity(body.len() * 4);
        GzDecoder::new(body)
            .read_to_end(&mut bytes)
            .map_err(CodecError::Decompress)?;
        Ok(Payload::new(encoding, bytes))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use time::{OffsetDateTime, macros::datetime};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Visit {
        patient_id: String,
        notes: Vec<String>,
        scanned_form: Vec<u8>,
        scheduled_for: OffsetDateTime,
    }

    fn structured_value() -> Value {
        json!({
            "name": "Ana",
            "age": 42,
            "balance": -12.5,
            "active": true,
            "guardian": null,
            "allergies": ["penicillin", "latex"],
            "address": { "city": "Recife", "zip": "50000-000" }
        })
    }

    fn large_value() -> Value {
        let notes: Vec<String> = (0..200)
            .map(|i| format!("follow-up note {i}: blood pressure stable"))
            .collect();
        json!({ "patient": "patient:42", "notes": notes })
    }

    #[test]
    fn small_values_round_trip_uncompressed() {
        for encoding in [Encoding::Json, Encoding::MessagePack] {
            let codec = Codec::new(encoding);
            let envelope = codec.serialize(&structured_value()).expect("serialize");

            assert_eq!(envelope[0] & FLAG_COMPRESSED, 0);
            assert_eq!(envelope[0] & ENCODING_MASK, encoding.tag());

            let decoded: Value = codec.deserialize(&envelope).expect("deserialize");
            assert_eq!(decoded, structured_value());
        }
    }

    #[test]
    fn large_values_are_compressed_and_round_trip() {
        for encoding in [Encoding::Json, Encoding::MessagePack] {
            let codec = Codec::new(encoding);
            let payload = codec.encode(&large_value()).expect("encode");
            assert!(payload.len() > DEFAULT_COMPRESSION_THRESHOLD);

            let envelope = codec.seal(&payload).expect("seal");
            assert_ne!(envelope[0] & FLAG_COMPRESSED, 0);
            assert!(envelope.len() < payload.len());

            let decoded: Value = codec.deserialize(&envelope).expect("deserialize");
            assert_eq!(decoded, large_value());
        }
    }

    #[test]
    fn scalars_round_trip() {
        let codec = Codec::default();
        for value in [json!(null), json!(true), json!(7), json!(1.25), json!("x")] {
            let envelope = codec.serialize(&value).expect("serialize");
            let decoded: Value = codec.deserialize(&envelope).expect("deserialize");
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn message_pack_keeps_blobs_and_dates() {
        let codec = Codec::new(Encoding::MessagePack);
        let visit = Visit {
            patient_id: "42".to_string(),
            notes: vec!["first visit".to_string()],
            scanned_form: vec![0, 159, 146, 150, 255],
            scheduled_for: datetime!(2024-03-01 09:30 -3),
        };

        let envelope = codec.serialize(&visit).expect("serialize");
        let decoded: Visit = codec.deserialize(&envelope).expect("deserialize");
        assert_eq!(decoded, visit);
    }

    #[test]
    fn header_selects_the_decoder() {
        let writer = Codec::new(Encoding::Json);
        let reader = Codec::new(Encoding::MessagePack);

        let envelope = writer.serialize(&structured_value()).expect("serialize");
        let decoded: Value = reader.deserialize(&envelope).expect("deserialize");
        assert_eq!(decoded, structured_value());
    }

    #[test]
    fn malformed_envelopes_are_deserialization_errors() {
        let codec = Codec::default();

        let empty = codec.deserialize::<Value>(&[]).expect_err("empty envelope");
        assert!(matches!(empty, CodecError::Empty));

        let unknown = codec
            .deserialize::<Value>(&[0x0f, 1, 2])
            .expect_err("unknown tag");
        assert!(matches!(unknown, CodecError::UnknownEncoding(0x0f)));

        let reserved = codec
            .deserialize::<Value>(&[0x70, b'1'])
            .expect_err("reserved header bits");
        assert!(matches!(reserved, CodecError::ReservedBits(0x70)));
        assert!(reserved.is_deserialization());

        let corrupt = codec
            .deserialize::<Value>(&[FLAG_COMPRESSED | 1, 0xde, 0xad, 0xbe, 0xef])
            .expect_err("corrupt gzip");
        assert!(corrupt.is_deserialization());

        let garbage = codec
            .deserialize::<Value>(&[0, b'{', b'x'])
            .expect_err("bad json");
        assert!(matches!(garbage, CodecError::Decode { .. }));
    }
}
