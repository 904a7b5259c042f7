//! Wire schema and framing for the discovery fabric.
//!
//! Every message, multicast discovery envelopes and unicast control frames
//! alike, is `u32 big-endian length || postcard payload`. The framing is
//! deliberately not DNS-compatible: records carry structured fields instead
//! of compressed label sequences, and the port is not 5353.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use thiserror::Error;

/// IPv4 group every engine joins and announces to.
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Discovery port. Not 5353: this protocol does not interoperate with mDNS.
pub const MULTICAST_PORT: u16 = 5369;

/// Bytes of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame shorter than the 4-byte length prefix")]
    ShortFrame,
    #[error("frame announces {announced} payload bytes but only {available} follow the prefix")]
    TruncatedPayload { announced: usize, available: usize },
    #[error("encode: {0}")]
    Encode(postcard::Error),
    #[error("decode: {0}")]
    Decode(postcard::Error),
}

/// Maps a service type to one instance domain living under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerData {
    pub name: String,
    pub domain_name: String,
}

/// One IPv4 address (dotted string) of an instance domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressData {
    pub name: String,
    pub address: String,
}

/// Port and target of an instance's control endpoint. The label fields are
/// opaque: they are filled on emission and never interpreted on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointData {
    pub name: String,
    pub protocol: String,
    pub service: String,
    pub instance: String,
    pub port: u16,
    pub target: String,
}

/// Key/value properties of an instance domain. BTreeMap keeps the encoded
/// byte sequence stable for identical property sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextData {
    pub name: String,
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordData {
    Pointer(PointerData),
    Address(AddressData),
    Endpoint(EndpointData),
    Text(TextData),
}

/// The four record roles. Doubles as the question type and the detail-index
/// key in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Pointer,
    Address,
    Endpoint,
    Text,
}

/// A discovery record: common header plus exactly one role payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    /// Lifetime in seconds. Zero means goodbye.
    pub ttl: u32,
    pub cache_flush: bool,
    pub data: RecordData,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match &self.data {
            RecordData::Pointer(_) => RecordKind::Pointer,
            RecordData::Address(_) => RecordKind::Address,
            RecordData::Endpoint(_) => RecordKind::Endpoint,
            RecordData::Text(_) => RecordKind::Text,
        }
    }

    pub fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub name: String,
    pub kind: RecordKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Query {
        questions: Vec<Question>,
    },
    Response {
        answers: Vec<Record>,
        additional: Vec<Record>,
    },
}

/// Outer packet. The transaction id is random per send and only ever used to
/// disambiguate self-echo; nothing correlates on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub transaction_id: u16,
    pub timestamp_ms: i64,
    pub payload: Payload,
}

/// Serializes `msg` and prepends the 4-byte big-endian length.
pub fn frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let payload = postcard::to_allocvec(msg).map_err(WireError::Encode)?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Strips the length prefix and returns exactly the announced payload slice.
/// Trailing bytes beyond the announced length are discarded.
pub fn unframe(data: &[u8]) -> Result<&[u8], WireError> {
    if data.len() < LENGTH_PREFIX_BYTES {
        return Err(WireError::ShortFrame);
    }
    let announced = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let rest = &data[LENGTH_PREFIX_BYTES..];
    if rest.len() < announced {
        return Err(WireError::TruncatedPayload {
            announced,
            available: rest.len(),
        });
    }
    Ok(&rest[..announced])
}

/// Decodes a payload slice produced by [`unframe`].
pub fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, WireError> {
    postcard::from_bytes(payload).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            transaction_id: 777,
            timestamp_ms: 1_700_000_000_000,
            payload: Payload::Query {
                questions: vec![Question {
                    name: "_sink._tcp.local.".into(),
                    kind: RecordKind::Pointer,
                }],
            },
        }
    }

    #[test]
    fn frame_round_trip() {
        let env = sample_envelope();
        let bytes = frame(&env).unwrap();
        let payload = unframe(&bytes).unwrap();
        let back: Envelope = decode(payload).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn short_frame_rejected() {
        assert!(matches!(unframe(&[0, 0, 1]), Err(WireError::ShortFrame)));
        assert!(matches!(unframe(&[]), Err(WireError::ShortFrame)));
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut bytes = frame(&sample_envelope()).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            unframe(&bytes),
            Err(WireError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn trailing_bytes_discarded() {
        let env = sample_envelope();
        let mut bytes = frame(&env).unwrap();
        bytes.extend_from_slice(b"leftover junk from a reused buffer");
        let payload = unframe(&bytes).unwrap();
        let back: Envelope = decode(payload).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn response_with_records_round_trips() {
        let record = Record {
            name: "_lightlamp._tcp.local.".into(),
            ttl: 4500,
            cache_flush: false,
            data: RecordData::Pointer(PointerData {
                name: "_lightlamp._tcp.local.".into(),
                domain_name: "Lamp._lightlamp._tcp.local.".into(),
            }),
        };
        let env = Envelope {
            transaction_id: 42,
            timestamp_ms: 0,
            payload: Payload::Response {
                answers: vec![record.clone()],
                additional: vec![],
            },
        };
        let back: Envelope = decode(unframe(&frame(&env).unwrap()).unwrap()).unwrap();
        assert_eq!(back, env);
        assert_eq!(record.kind(), RecordKind::Pointer);
        assert!(!record.is_goodbye());
    }
}
