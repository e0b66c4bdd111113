//! # Upstream Binary Frame Codec
//!
//! Pure encode/decode functions for the provider's binary WebSocket protocol.
//! Nothing in here touches a socket, so every rule below is testable on its own.
//!
//! ## Frame Layout:
//! ```text
//! byte 0   version (high nibble) | header size in 4-byte words (low nibble)
//! byte 1   message type (high nibble) | flags (low nibble, bit0 = sequence present)
//! byte 2   serialization (high nibble) | compression (low nibble)
//! byte 3   reserved
//! [4 bytes big-endian sequence]      when flags bit0 is set
//! [4 bytes big-endian payload size]  for length-prefixed message types
//! payload                            gzip-compressed when compression = 1
//! ```
//!
//! ## Transcript Extraction:
//! The provider has shipped several envelope shapes over time, so
//! [`extract_transcript`] walks a short list of known paths instead of
//! binding to one schema.

use byteorder::{BigEndian, ByteOrder};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::{Read, Write};

/// Protocol version written into the high nibble of byte 0.
const PROTOCOL_VERSION: u8 = 0x1;

/// Header size in 4-byte words for every frame we emit.
const HEADER_WORDS: u8 = 0x1;

/// Flag bit signalling that a sequence number follows the header.
const FLAG_SEQUENCE: u8 = 0x1;

/// Message types carried in the high nibble of byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Config,
    Audio,
    Stop,
    ServerResponse,
    Other(u8),
}

impl MessageType {
    pub fn from_nibble(value: u8) -> Self {
        match value {
            0x1 => MessageType::Config,
            0x2 => MessageType::Audio,
            0x4 => MessageType::Stop,
            0x9 => MessageType::ServerResponse,
            other => MessageType::Other(other),
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            MessageType::Config => 0x1,
            MessageType::Audio => 0x2,
            MessageType::Stop => 0x4,
            MessageType::ServerResponse => 0x9,
            MessageType::Other(value) => value & 0x0F,
        }
    }

    /// Whether a 4-byte payload size precedes the payload.
    ///
    /// Server responses always carry one, and so does every client frame
    /// produced by [`encode_frame`].
    pub fn is_length_prefixed(self) -> bool {
        !matches!(self, MessageType::Other(_))
    }
}

/// Payload serialization carried in the high nibble of byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Raw,
    Json,
}

impl Serialization {
    fn nibble(self) -> u8 {
        match self {
            Serialization::Raw => 0x0,
            Serialization::Json => 0x1,
        }
    }
}

/// Errors produced while encoding or decoding a frame.
///
/// None of these are fatal to a session: callers log them and keep reading.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("binary frame too short: {0} bytes")]
    ShortFrame(usize),

    #[error("invalid header size: {header_bytes} header bytes, {len} available")]
    InvalidHeader { header_bytes: usize, len: usize },

    #[error("frame flags announce a sequence number but the payload is missing it")]
    MissingSequence,

    #[error("payload size mismatch: declared {declared} bytes, {available} available")]
    SizeMismatch { declared: usize, available: usize },

    #[error("gzip compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("gzip decompression failed: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("invalid JSON payload: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
        /// Decompressed payload, kept for diagnostics.
        raw: Vec<u8>,
    },
}

/// Header fields read back from an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: u8,
    pub compression: u8,
    pub sequence: Option<u32>,
}

/// A fully decoded frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    /// JSON envelope, or `{"text": <payload>}` for non-JSON payloads.
    pub envelope: Value,
    /// Payload bytes after length slicing and decompression.
    pub payload: Vec<u8>,
}

/// Build one outbound frame.
///
/// The sequence number is supplied by the owning session, which increments
/// it once per frame regardless of type.
pub fn encode_frame(
    message_type: MessageType,
    serialization: Serialization,
    sequence: u32,
    payload: &[u8],
    compress: bool,
) -> Result<Vec<u8>, FrameError> {
    let (body, compression) = if compress {
        (gzip_compress(payload)?, 0x1)
    } else {
        (payload.to_vec(), 0x0)
    };

    let mut frame = Vec::with_capacity(12 + body.len());
    frame.push((PROTOCOL_VERSION << 4) | HEADER_WORDS);
    frame.push((message_type.nibble() << 4) | FLAG_SEQUENCE);
    frame.push((serialization.nibble() << 4) | compression);
    frame.push(0x00);

    let mut word = [0u8; 4];
    BigEndian::write_u32(&mut word, sequence);
    frame.extend_from_slice(&word);
    BigEndian::write_u32(&mut word, body.len() as u32);
    frame.extend_from_slice(&word);
    frame.extend_from_slice(&body);

    Ok(frame)
}

/// Decode one inbound binary frame.
pub fn decode_frame(data: &[u8]) -> Result<DecodedFrame, FrameError> {
    if data.len() < 4 {
        return Err(FrameError::ShortFrame(data.len()));
    }

    let header_words = usize::from(data[0] & 0x0F).max(1);
    let base_offset = header_words * 4;
    if data.len() < base_offset {
        return Err(FrameError::InvalidHeader {
            header_bytes: base_offset,
            len: data.len(),
        });
    }

    let flags = data[1] & 0x0F;
    let message_type = MessageType::from_nibble(data[1] >> 4);
    let serialization = data[2] >> 4;
    let compression = data[2] & 0x0F;

    let mut payload = &data[base_offset..];

    let mut sequence = None;
    if flags & FLAG_SEQUENCE == FLAG_SEQUENCE {
        if payload.len() < 4 {
            return Err(FrameError::MissingSequence);
        }
        sequence = Some(BigEndian::read_u32(&payload[..4]));
        payload = &payload[4..];
    }

    if message_type.is_length_prefixed() && payload.len() >= 4 {
        let declared = BigEndian::read_u32(&payload[..4]) as usize;
        let available = payload.len() - 4;
        if declared > available {
            return Err(FrameError::SizeMismatch {
                declared,
                available,
            });
        }
        payload = &payload[4..4 + declared];
    }

    let payload = if compression == 0x1 {
        gzip_decompress(payload)?
    } else {
        payload.to_vec()
    };

    let envelope = if serialization == 0x1 {
        parse_json_payload(&payload)?
    } else {
        json!({ "text": String::from_utf8_lossy(&payload) })
    };

    Ok(DecodedFrame {
        header: FrameHeader {
            message_type,
            flags,
            serialization,
            compression,
            sequence,
        },
        envelope,
        payload,
    })
}

/// Parse a JSON payload, which must open with an object or an array.
pub fn parse_json_payload(payload: &[u8]) -> Result<Value, FrameError> {
    let leading = payload.iter().find(|b| !b.is_ascii_whitespace());
    if !matches!(leading, Some(b'{') | Some(b'[')) {
        return Err(FrameError::Parse {
            source: <serde_json::Error as serde::de::Error>::custom(
                "payload is not a JSON object or array",
            ),
            raw: payload.to_vec(),
        });
    }

    serde_json::from_slice(payload).map_err(|source| FrameError::Parse {
        source,
        raw: payload.to_vec(),
    })
}

/// Transcript fields pulled out of an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub duration_ms: u64,
}

/// Walk the known envelope shapes for text, finality, and duration.
///
/// Returns `("", false, 0)` when nothing matches. Never fails.
pub fn extract_transcript(envelope: &Value) -> Transcript {
    let result_objects = [
        envelope.get("result"),
        envelope.pointer("/data/result"),
        envelope.pointer("/payload/result"),
    ];

    let text = result_objects
        .iter()
        .flatten()
        .find_map(|result| {
            non_empty_str(result.get("text")).or_else(|| non_empty_str(result.get("best_text")))
        })
        .or_else(|| non_empty_str(envelope.get("text")))
        .unwrap_or_default()
        .to_string();

    let is_final = finality(envelope)
        || result_objects.iter().flatten().any(|result| finality(result));

    let duration_ms = std::iter::once(Some(envelope))
        .chain(result_objects)
        .flatten()
        .find_map(duration_marker)
        .unwrap_or(0);

    Transcript {
        text,
        is_final,
        duration_ms,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|text| !text.is_empty())
}

fn finality(object: &Value) -> bool {
    let flag = |key: &str| match object.get(key) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    };

    if flag("is_final") || flag("final") {
        return true;
    }

    matches!(
        object.get("type").and_then(Value::as_str),
        Some(kind) if kind.eq_ignore_ascii_case("final") || kind.eq_ignore_ascii_case("end")
    )
}

fn duration_marker(object: &Value) -> Option<u64> {
    if let Some(ms) = object.get("duration").and_then(as_millis) {
        return Some(ms);
    }
    if let Some(ms) = object.get("duration_ms").and_then(as_millis) {
        return Some(ms);
    }
    object
        .get("segment_time")
        .and_then(Value::as_f64)
        .filter(|seconds| *seconds > 0.0)
        .map(|seconds| (seconds * 1000.0).round() as u64)
}

/// Accept integer, float, or numeric-string durations.
pub(crate) fn as_millis(value: &Value) -> Option<u64> {
    let ms = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (ms > 0.0).then(|| ms.round() as u64)
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(FrameError::Compression)?;
    encoder.finish().map_err(FrameError::Compression)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(FrameError::Decompression)?;
    Ok(out)
}
