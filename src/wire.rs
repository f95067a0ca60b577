//! # Wire Protocol
//!
//! Binary framing for every message exchanged between peers. A frame is a
//! fixed 13-byte header followed by the payload:
//!
//! ```text
//! +------+----------------+------------------+-------------------+
//! | kind | payload length |    timestamp     |      payload      |
//! |  u8  |   u32 (BE)     | u64 ms (BE)      | `length` bytes    |
//! +------+----------------+------------------+-------------------+
//! ```
//!
//! The payload length field is authoritative: a buffer shorter than
//! `13 + length` is rejected. The codec itself places no upper bound on the
//! payload; the transport enforces [`MAX_PAYLOAD_LEN`] before allocating.
//!
//! Two payload layouts are defined on top of the frame:
//!
//! - [`HandshakePayload`]: `id_len: u16 | id | public_key (remainder)`
//! - peer lists: `count: u16 | count × (len: u16 | address)`

use bytes::{Buf, BufMut, BytesMut};
use std::borrow::Cow;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 13;

/// Largest payload the transport accepts from a remote peer (10 MiB).
pub const MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

/// Errors produced while decoding frames or structured payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },
    #[error("payload size mismatch: header declares {declared} bytes, {available} available")]
    PayloadSizeMismatch { declared: usize, available: usize },
    #[error("handshake id length {declared} exceeds remaining {remaining} bytes")]
    HandshakeIdOverrun { declared: usize, remaining: usize },
    #[error("peer id is not valid UTF-8")]
    InvalidPeerId,
    #[error("peer list truncated")]
    PeerListTruncated,
    #[error("field of {len} bytes does not fit a u16 length prefix")]
    FieldTooLong { len: usize },
    #[error("expected {expected:?} message, got {found:?}")]
    UnexpectedKind {
        expected: MessageKind,
        found: MessageKind,
    },
}

/// Protocol message kinds.
///
/// Kind bytes this build does not know are kept as [`MessageKind::Unknown`]
/// so newer peers can pass them through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Handshake,
    PeerList,
    Ping,
    Pong,
    FileChunk,
    KeyExchange,
    Unknown(u8),
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageKind::Text => 0,
            MessageKind::Handshake => 1,
            MessageKind::PeerList => 2,
            MessageKind::Ping => 3,
            MessageKind::Pong => 4,
            MessageKind::FileChunk => 5,
            MessageKind::KeyExchange => 6,
            MessageKind::Unknown(byte) => byte,
        }
    }
}

impl From<u8> for MessageKind {
    fn from(byte: u8) -> Self {
        match byte {
            0 => MessageKind::Text,
            1 => MessageKind::Handshake,
            2 => MessageKind::PeerList,
            3 => MessageKind::Ping,
            4 => MessageKind::Pong,
            5 => MessageKind::FileChunk,
            6 => MessageKind::KeyExchange,
            other => MessageKind::Unknown(other),
        }
    }
}

/// One protocol message. Constructed per send/receive and then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    kind: MessageKind,
    payload: Vec<u8>,
    timestamp: u64,
}

impl WireMessage {
    /// Create a message stamped with the current time.
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self::with_timestamp(kind, payload, now_millis())
    }

    pub fn with_timestamp(kind: MessageKind, payload: Vec<u8>, timestamp: u64) -> Self {
        Self {
            kind,
            payload,
            timestamp,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Milliseconds since the Unix epoch at which the sender built the message.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn sent_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        i64::try_from(self.timestamp)
            .ok()
            .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
    }

    /// Payload interpreted as UTF-8, with invalid sequences replaced.
    pub fn text_payload(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Encode into a frame of exactly `HEADER_LEN + payload.len()` bytes.
    ///
    /// The length field is a `u32`, so payloads must stay below 4 GiB.
    /// Peers reject anything above [`MAX_PAYLOAD_LEN`] regardless.
    pub fn serialize(&self) -> Vec<u8> {
        debug_assert!(
            u32::try_from(self.payload.len()).is_ok(),
            "payload of {} bytes does not fit the u32 length field",
            self.payload.len()
        );
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.as_byte());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u64(self.timestamp);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode a frame. Bytes beyond the declared payload are ignored.
    pub fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::TooShort { len: data.len() });
        }

        let mut buf = data;
        let kind = MessageKind::from(buf.get_u8());
        let declared = buf.get_u32() as usize;
        let timestamp = buf.get_u64();

        if buf.remaining() < declared {
            return Err(CodecError::PayloadSizeMismatch {
                declared,
                available: buf.remaining(),
            });
        }

        Ok(Self {
            kind,
            payload: buf[..declared].to_vec(),
            timestamp,
        })
    }

    pub fn text(text: &str) -> Self {
        Self::new(MessageKind::Text, text.as_bytes().to_vec())
    }

    pub fn handshake(peer_id: &str, public_key: &[u8]) -> Result<Self, CodecError> {
        let payload = HandshakePayload {
            peer_id: peer_id.to_string(),
            public_key: public_key.to_vec(),
        }
        .encode()?;
        Ok(Self::new(MessageKind::Handshake, payload))
    }

    pub fn peer_list<S: AsRef<str>>(peers: &[S]) -> Result<Self, CodecError> {
        Ok(Self::new(MessageKind::PeerList, encode_peer_list(peers)?))
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Vec::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, Vec::new())
    }

    pub fn file_chunk(data: Vec<u8>) -> Self {
        Self::new(MessageKind::FileChunk, data)
    }

    pub fn key_exchange(data: Vec<u8>) -> Self {
        Self::new(MessageKind::KeyExchange, data)
    }

    /// Decode the handshake carried by this message.
    pub fn to_handshake(&self) -> Result<HandshakePayload, CodecError> {
        self.expect_kind(MessageKind::Handshake)?;
        HandshakePayload::decode(&self.payload)
    }

    /// Decode the address list carried by this message.
    pub fn to_peer_list(&self) -> Result<Vec<String>, CodecError> {
        self.expect_kind(MessageKind::PeerList)?;
        decode_peer_list(&self.payload)
    }

    fn expect_kind(&self, expected: MessageKind) -> Result<(), CodecError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(CodecError::UnexpectedKind {
                expected,
                found: self.kind,
            })
        }
    }
}

/// Payload length declared by a frame header.
pub fn declared_payload_len(header: &[u8; HEADER_LEN]) -> usize {
    u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize
}

/// Identity advertised by a peer on first contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub peer_id: String,
    pub public_key: Vec<u8>,
}

impl HandshakePayload {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let id_len = u16_len(self.peer_id.len())?;
        let mut buf = BytesMut::with_capacity(2 + self.peer_id.len() + self.public_key.len());
        buf.put_u16(id_len);
        buf.put_slice(self.peer_id.as_bytes());
        buf.put_slice(&self.public_key);
        Ok(buf.to_vec())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::HandshakeIdOverrun {
                declared: 2,
                remaining: payload.len(),
            });
        }

        let mut buf = payload;
        let declared = buf.get_u16() as usize;
        if declared > buf.remaining() {
            return Err(CodecError::HandshakeIdOverrun {
                declared,
                remaining: buf.remaining(),
            });
        }

        let peer_id = std::str::from_utf8(&buf[..declared])
            .map_err(|_| CodecError::InvalidPeerId)?
            .to_string();
        buf.advance(declared);

        Ok(Self {
            peer_id,
            public_key: buf.to_vec(),
        })
    }
}

pub fn encode_peer_list<S: AsRef<str>>(peers: &[S]) -> Result<Vec<u8>, CodecError> {
    let count = u16_len(peers.len())?;
    let mut buf = BytesMut::new();
    buf.put_u16(count);
    for peer in peers {
        let peer = peer.as_ref();
        buf.put_u16(u16_len(peer.len())?);
        buf.put_slice(peer.as_bytes());
    }
    Ok(buf.to_vec())
}

pub fn decode_peer_list(payload: &[u8]) -> Result<Vec<String>, CodecError> {
    let mut buf = payload;
    if buf.remaining() < 2 {
        return Err(CodecError::PeerListTruncated);
    }

    let count = buf.get_u16() as usize;
    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 2 {
            return Err(CodecError::PeerListTruncated);
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(CodecError::PeerListTruncated);
        }
        peers.push(String::from_utf8_lossy(&buf[..len]).into_owned());
        buf.advance(len);
    }

    Ok(peers)
}

fn u16_len(len: usize) -> Result<u16, CodecError> {
    u16::try_from(len).map_err(|_| CodecError::FieldTooLong { len })
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
