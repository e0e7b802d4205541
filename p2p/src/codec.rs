//! # Wire Envelopes
//!
//! Three layers of envelope travel over the network:
//!
//! ```text
//! RainTreeMessage { level, nonce, data } ─┐
//! BackgroundMessage { data } ─────────────┴─► data = PocketEnvelope bytes
//! PocketEnvelope { type_url, value, nonce }   ◄── what the node sees
//! ```
//!
//! Every stream carries exactly one frame: a big-endian `u32` length followed
//! by the bincode body. Frames above [`MAX_FRAME_SIZE`] are rejected before
//! any allocation proportional to the claimed length happens.
//!
//! Domain payloads are opaque `{type_url, value}` pairs. [`MessageKind`]
//! names the kinds this node knows about and falls back to `Other` so newer
//! peers can introduce kinds without breaking older ones.
//! [`EnvelopeRegistry`] attaches a decoder per type URL; the background
//! topic validator uses it to reject garbage before it is gossiped further.

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::MAX_FRAME_SIZE;

/// Length of the frame header.
const FRAME_HEADER_LEN: usize = 4;

/// Errors raised while encoding, decoding, or validating envelopes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Body is not a valid encoding of the expected type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Frame is shorter than its header claims, or has trailing bytes.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Claimed or actual size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// Envelope has no type URL.
    #[error("envelope has an empty type url")]
    EmptyTypeUrl,

    /// A registered decoder refused the envelope value.
    #[error("envelope of type {type_url} rejected: {reason}")]
    Rejected {
        /// Type URL of the rejected envelope.
        type_url: String,
        /// Decoder's reason.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Domain payload plus its type tag. This is what consumers send and receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PocketEnvelope {
    /// Fully qualified type of `value`.
    pub type_url: String,
    /// Encoded domain message.
    pub value: Vec<u8>,
    /// Originator-chosen nonce; lets consumers dedup across routers.
    pub nonce: u64,
}

impl PocketEnvelope {
    /// Wraps a payload with a fresh random nonce.
    pub fn new(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
            nonce: crate::crypto::random_nonce(),
        }
    }

    /// Kind derived from the type URL.
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_type_url(&self.type_url)
    }

    /// Serializes the envelope body (unframed; it travels inside `data`).
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.type_url.is_empty() {
            return Err(CodecError::EmptyTypeUrl);
        }
        encode_body(self)
    }

    /// Parses an envelope body.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Self = decode_body(bytes)?;
        if envelope.type_url.is_empty() {
            return Err(CodecError::EmptyTypeUrl);
        }
        Ok(envelope)
    }
}

/// RainTree wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RainTreeMessage {
    /// Tree level the receiver continues from.
    pub level: u8,
    /// Originator nonce, shared by every copy of one broadcast.
    pub nonce: u64,
    /// Encoded `PocketEnvelope`.
    pub data: Vec<u8>,
}

/// Background router wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundMessage {
    /// Encoded `PocketEnvelope`.
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Type URL of consensus messages.
pub const CONSENSUS_TYPE_URL: &str = "type.googleapis.com/consensus.HotstuffMessage";
/// Type URL of state-sync messages.
pub const STATE_SYNC_TYPE_URL: &str = "type.googleapis.com/consensus.StateSyncMessage";
/// Type URL of gossiped transactions.
pub const TRANSACTION_TYPE_URL: &str = "type.googleapis.com/utility.TxGossipMessage";
/// Type URL of debug messages.
pub const DEBUG_TYPE_URL: &str = "type.googleapis.com/messaging.DebugMessage";

/// Known envelope kinds, with an opaque fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Consensus (HotStuff) traffic.
    Consensus,
    /// Block/state synchronization.
    StateSync,
    /// Transaction gossip.
    Transaction,
    /// Operator debug messages.
    Debug,
    /// Anything else, carried through untouched.
    Other(String),
}

impl MessageKind {
    /// Classifies a type URL.
    pub fn from_type_url(type_url: &str) -> Self {
        match type_url {
            CONSENSUS_TYPE_URL => Self::Consensus,
            STATE_SYNC_TYPE_URL => Self::StateSync,
            TRANSACTION_TYPE_URL => Self::Transaction,
            DEBUG_TYPE_URL => Self::Debug,
            other => Self::Other(other.to_string()),
        }
    }

    /// Type URL for this kind.
    pub fn type_url(&self) -> &str {
        match self {
            Self::Consensus => CONSENSUS_TYPE_URL,
            Self::StateSync => STATE_SYNC_TYPE_URL,
            Self::Transaction => TRANSACTION_TYPE_URL,
            Self::Debug => DEBUG_TYPE_URL,
            Self::Other(url) => url,
        }
    }
}

/// Decoder check for one type URL.
pub type EnvelopeDecoder = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

/// Per-type-URL decoders used to validate inbound envelopes.
///
/// Type URLs with no registered decoder are accepted as opaque payloads.
#[derive(Clone, Default)]
pub struct EnvelopeRegistry {
    decoders: HashMap<String, EnvelopeDecoder>,
}

impl EnvelopeRegistry {
    /// Registry with no decoders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the decoder for a type URL.
    pub fn register(&mut self, type_url: impl Into<String>, decoder: EnvelopeDecoder) {
        self.decoders.insert(type_url.into(), decoder);
    }

    /// Decodes an envelope and runs its registered decoder, if any.
    pub fn decode(&self, bytes: &[u8]) -> Result<PocketEnvelope, CodecError> {
        let envelope = PocketEnvelope::decode(bytes)?;
        if let Some(decoder) = self.decoders.get(&envelope.type_url) {
            decoder(&envelope.value).map_err(|reason| CodecError::Rejected {
                type_url: envelope.type_url.clone(),
                reason,
            })?;
        }
        Ok(envelope)
    }
}

impl std::fmt::Debug for EnvelopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeRegistry")
            .field("type_urls", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_SIZE as u64)
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode_options()
        .serialize(value)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encodes one length-prefixed frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
    let body = encode_body(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Decodes exactly one length-prefixed frame. Trailing bytes are an error.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, CodecError> {
    let mut buf = frame;
    if buf.remaining() < FRAME_HEADER_LEN {
        return Err(CodecError::MalformedFrame(format!(
            "{} bytes is shorter than the frame header",
            frame.len()
        )));
    }
    let len = buf.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.remaining() != len {
        return Err(CodecError::MalformedFrame(format!(
            "header claims {len} bytes, frame carries {}",
            buf.remaining()
        )));
    }
    decode_body(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raintree_frame_round_trip() {
        let envelope = PocketEnvelope::new(CONSENSUS_TYPE_URL, b"vote".to_vec());
        let message = RainTreeMessage {
            level: 3,
            nonce: 42,
            data: envelope.encode().unwrap(),
        };
        let frame = encode_frame(&message).unwrap();
        assert_eq!(
            u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize,
            frame.len() - FRAME_HEADER_LEN
        );

        let decoded: RainTreeMessage = decode_frame(&frame).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(PocketEnvelope::decode(&decoded.data).unwrap(), envelope);
    }

    #[test]
    fn truncated_and_padded_frames_are_rejected() {
        let frame = encode_frame(&BackgroundMessage { data: vec![1, 2, 3] }).unwrap();

        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(
            decode_frame::<BackgroundMessage>(truncated),
            Err(CodecError::MalformedFrame(_))
        ));

        let mut padded = frame.to_vec();
        padded.push(0);
        assert!(matches!(
            decode_frame::<BackgroundMessage>(&padded),
            Err(CodecError::MalformedFrame(_))
        ));

        assert!(decode_frame::<BackgroundMessage>(&[0, 0]).is_err());
    }

    #[test]
    fn oversized_header_is_rejected_without_reading_body() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        frame.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame::<BackgroundMessage>(&frame),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_is_not_an_envelope() {
        assert!(PocketEnvelope::decode(b"definitely not bincode").is_err());
        let empty = PocketEnvelope {
            type_url: String::new(),
            value: vec![],
            nonce: 1,
        };
        assert_eq!(empty.encode(), Err(CodecError::EmptyTypeUrl));
    }

    #[test]
    fn message_kind_falls_back_to_other() {
        assert_eq!(MessageKind::from_type_url(CONSENSUS_TYPE_URL), MessageKind::Consensus);
        let kind = MessageKind::from_type_url("type.example/new.Thing");
        assert_eq!(kind, MessageKind::Other("type.example/new.Thing".into()));
        assert_eq!(kind.type_url(), "type.example/new.Thing");
    }

    #[test]
    fn registry_runs_decoder_for_known_types_only() {
        let mut registry = EnvelopeRegistry::new();
        registry.register(
            TRANSACTION_TYPE_URL,
            Arc::new(|value: &[u8]| {
                if value.is_empty() {
                    Err("empty transaction".to_string())
                } else {
                    Ok(())
                }
            }),
        );

        let good = PocketEnvelope::new(TRANSACTION_TYPE_URL, vec![1]);
        let bad = PocketEnvelope::new(TRANSACTION_TYPE_URL, vec![]);
        let opaque = PocketEnvelope::new("type.example/Unknown", vec![]);

        assert!(registry.decode(&good.encode().unwrap()).is_ok());
        assert!(matches!(
            registry.decode(&bad.encode().unwrap()),
            Err(CodecError::Rejected { .. })
        ));
        assert!(registry.decode(&opaque.encode().unwrap()).is_ok());
    }
}
