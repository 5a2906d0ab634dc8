//! Binary codec for LanChat frames.
//!
//! Wire format:
//! ```text
//! [kind:4][length:4][payload:length]
//! ```
//! Header size: 8 bytes. Both integers are big-endian.  The payload is UTF-8
//! text for `Message` frames and absent (`length == 0`) for control frames.
//!
//! Two decoding entry points exist:
//!
//! - [`decode_message`] decodes one complete frame from a slice, in the same
//!   style as [`encode_message`].
//! - [`FrameDecoder`] accumulates bytes from a stream and yields messages as
//!   soon as they are complete.  It never consumes a partial header or a
//!   partial payload, so it can be fed arbitrarily split chunks.

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::messages::{
    FrameHeader, Message, MessageKind, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAX_ENCODABLE_PAYLOAD,
};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload does not fit the header's length field (or the decoder's limit).
    #[error("payload of {length} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { length: usize, max: usize },

    /// The stream ended after part of a frame had been received.
    #[error("stream ended mid-frame with {buffered} byte(s) of an incomplete frame")]
    TruncatedFrame { buffered: usize },

    /// The byte slice is shorter than a frame header.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The header declares more payload than the slice holds.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The kind tag in the header is not a recognized value.
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u32),

    /// The payload could not be parsed (invalid UTF-8).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A control signal was requested with a payload-carrying kind.
    #[error("{0:?} is not a control kind")]
    NotAControlKind(MessageKind),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes a header for `kind` followed by `payload`.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if `payload` is longer than
/// `u32::MAX` bytes.
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_ENCODABLE_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            length: payload.len(),
            max: MAX_ENCODABLE_PAYLOAD,
        });
    }
    let header = FrameHeader {
        kind: kind as u32,
        length: payload.len() as u32,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encodes a [`Message`] into a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the text does not fit the
/// length field.
///
/// # Examples
///
/// ```rust
/// use lanchat_core::protocol::{decode_message, encode_message, Message};
///
/// let msg = Message::text("hello");
/// let bytes = encode_message(&msg).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = msg.payload().map(str::as_bytes).unwrap_or_default();
    encode_frame(msg.kind(), payload)
}

/// Encodes a payload-less control frame.
///
/// # Errors
///
/// Returns [`ProtocolError::NotAControlKind`] for [`MessageKind::Message`].
pub fn encode_control(kind: MessageKind) -> Result<Vec<u8>, ProtocolError> {
    if !kind.is_control() {
        return Err(ProtocolError::NotAControlKind(kind));
    }
    encode_frame(kind, &[])
}

// ── One-shot decoding ─────────────────────────────────────────────────────────

/// Decodes one [`Message`] from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed (header + payload).
///
/// # Errors
///
/// Returns [`ProtocolError`] if the slice is short, the kind is unknown or
/// the payload is not valid UTF-8.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let header = FrameHeader::parse(bytes).ok_or(ProtocolError::InsufficientData {
        needed: HEADER_SIZE,
        available: bytes.len(),
    })?;

    let payload_len = header.length as usize;
    let available = bytes.len() - HEADER_SIZE;
    if available < payload_len {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: payload_len,
            available,
        });
    }
    let total_needed = HEADER_SIZE + payload_len;

    let msg = decode_frame(header, &bytes[HEADER_SIZE..total_needed])?
        .ok_or(ProtocolError::UnknownMessageKind(header.kind))?;
    Ok((msg, total_needed))
}

/// Builds a [`Message`] from a complete frame.  `Ok(None)` means the kind is
/// unknown and the frame should be skipped.
fn decode_frame(header: FrameHeader, payload: &[u8]) -> Result<Option<Message>, ProtocolError> {
    let Ok(kind) = MessageKind::try_from(header.kind) else {
        return Ok(None);
    };

    if kind.carries_payload() {
        let text = std::str::from_utf8(payload)
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?;
        return Ok(Some(Message::text(text)));
    }

    if !payload.is_empty() {
        warn!(
            "discarding {} payload byte(s) on {kind:?} control frame",
            payload.len()
        );
    }
    Ok(Some(Message::control(kind)))
}

// ── Incremental decoding ──────────────────────────────────────────────────────

/// Reassembles messages from a byte stream delivered in arbitrary chunks.
///
/// The decoder is tied to a single stream: create one per connection.
///
/// ```rust
/// use lanchat_core::protocol::{encode_message, FrameDecoder, Message};
///
/// let bytes = encode_message(&Message::text("hi")).unwrap();
/// let mut decoder = FrameDecoder::new();
///
/// decoder.extend(&bytes[..5]);
/// assert_eq!(decoder.decode_next().unwrap(), None);
///
/// decoder.extend(&bytes[5..]);
/// assert_eq!(decoder.decode_next().unwrap(), Some(Message::text("hi")));
/// assert!(decoder.finish().is_ok());
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    /// Creates a decoder accepting payloads up to [`DEFAULT_MAX_PAYLOAD`].
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Creates a decoder rejecting headers that declare more than `max_payload` bytes.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    /// Appends bytes received from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete message, or `Ok(None)` if more bytes are needed.
    ///
    /// Frames with an unknown kind are consumed and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] when a header declares more
    /// than the configured maximum, or [`ProtocolError::MalformedPayload`] for
    /// non-UTF-8 text.  Both are fatal for the stream.
    pub fn decode_next(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            let Some(header) = FrameHeader::parse(&self.buf) else {
                return Ok(None);
            };

            let payload_len = header.length as usize;
            if payload_len > self.max_payload {
                return Err(ProtocolError::PayloadTooLarge {
                    length: payload_len,
                    max: self.max_payload,
                });
            }

            if self.buf.len() - HEADER_SIZE < payload_len {
                return Ok(None);
            }
            let total = HEADER_SIZE + payload_len;

            let decoded = decode_frame(header, &self.buf[HEADER_SIZE..total]);
            self.buf.drain(..total);

            match decoded? {
                Some(msg) => return Ok(Some(msg)),
                None => debug!("skipping frame with unknown kind {}", header.kind),
            }
        }
    }

    /// Checks that the stream ended on a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TruncatedFrame`] if a partial frame is buffered.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedFrame {
                buffered: self.buf.len(),
            })
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        let encoded = encode_message(msg).expect("encode failed");
        let (decoded, consumed) = decode_message(&encoded).expect("decode failed");
        assert_eq!(consumed, encoded.len(), "consumed bytes should equal total encoded size");
        decoded
    }

    // ── Round trips ──────────────────────────────────────────────────────────

    #[test]
    fn test_text_message_round_trip() {
        let msg = Message::text("hello");
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_multibyte_text_round_trip() {
        let msg = Message::text("salom dunyo, привет 👋");
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_control_messages_round_trip() {
        for kind in [MessageKind::Join, MessageKind::Leave, MessageKind::Cancel] {
            let msg = Message::control(kind);
            assert_eq!(round_trip(&msg), msg);
        }
    }

    // ── Header layout ────────────────────────────────────────────────────────

    #[test]
    fn test_header_length_equals_payload_byte_count() {
        let text = "ünïcödé";
        let bytes = encode_message(&Message::text(text)).unwrap();
        let declared = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(declared, text.len());
        assert_eq!(bytes.len(), HEADER_SIZE + text.len());
    }

    #[test]
    fn test_empty_text_message_is_header_only() {
        let bytes = encode_message(&Message::text("")).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(round_trip(&Message::text("")), Message::text(""));
    }

    #[test]
    fn test_control_frame_is_header_only() {
        let bytes = encode_control(MessageKind::Join).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_control_rejects_message_kind() {
        assert_eq!(
            encode_control(MessageKind::Message),
            Err(ProtocolError::NotAControlKind(MessageKind::Message))
        );
    }

    // ── One-shot error conditions ────────────────────────────────────────────

    #[test]
    fn test_decode_empty_bytes_returns_insufficient_data() {
        let result = decode_message(&[]);
        assert!(matches!(result, Err(ProtocolError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_truncated_header_returns_insufficient_data() {
        let result = decode_message(&[0x00, 0x00, 0x00]);
        assert!(matches!(
            result,
            Err(ProtocolError::InsufficientData {
                needed: HEADER_SIZE,
                available: 3
            })
        ));
    }

    #[test]
    fn test_decode_payload_length_exceeds_available_returns_error() {
        let mut bytes = encode_frame(MessageKind::Message, b"abc").unwrap();
        bytes[4..8].copy_from_slice(&100u32.to_be_bytes());
        let result = decode_message(&bytes);
        assert_eq!(
            result,
            Err(ProtocolError::PayloadLengthMismatch {
                declared: 100,
                available: 3
            })
        );
    }

    #[test]
    fn test_decode_maximum_declared_length_reports_mismatch() {
        // Arrange
        let mut bytes = encode_frame(MessageKind::Message, b"abcd").unwrap();
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());

        // Act
        let result = decode_message(&bytes);

        // Assert
        assert_eq!(
            result,
            Err(ProtocolError::PayloadLengthMismatch {
                declared: u32::MAX as usize,
                available: 4
            })
        );
    }

    #[test]
    fn test_decode_unknown_kind_returns_error() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&0xFFu32.to_be_bytes());
        assert_eq!(
            decode_message(&bytes),
            Err(ProtocolError::UnknownMessageKind(0xFF))
        );
    }

    #[test]
    fn test_decode_invalid_utf8_returns_malformed_payload() {
        let bytes = encode_frame(MessageKind::Message, &[0xC3, 0x28]).unwrap();
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_control_frame_with_payload_drops_payload() {
        let bytes = encode_frame(MessageKind::Leave, b"bye").unwrap();
        let (msg, consumed) = decode_message(&bytes).unwrap();
        assert_eq!(msg, Message::control(MessageKind::Leave));
        assert_eq!(consumed, bytes.len());
    }

    // ── FrameDecoder ─────────────────────────────────────────────────────────

    #[test]
    fn test_frame_decoder_waits_for_complete_header() {
        let bytes = encode_message(&Message::text("abc")).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&bytes[..HEADER_SIZE - 1]);
        assert_eq!(decoder.decode_next(), Ok(None));
        assert_eq!(decoder.buffered(), HEADER_SIZE - 1, "partial header must stay buffered");
    }

    #[test]
    fn test_frame_decoder_waits_for_complete_payload() {
        let bytes = encode_message(&Message::text("abcdef")).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&bytes[..HEADER_SIZE + 2]);
        assert_eq!(decoder.decode_next(), Ok(None));

        decoder.extend(&bytes[HEADER_SIZE + 2..]);
        assert_eq!(decoder.decode_next(), Ok(Some(Message::text("abcdef"))));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_decoder_yields_back_to_back_messages() {
        let mut stream = encode_control(MessageKind::Join).unwrap();
        stream.extend(encode_message(&Message::text("one")).unwrap());
        stream.extend(encode_message(&Message::text("two")).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert_eq!(decoder.decode_next(), Ok(Some(Message::control(MessageKind::Join))));
        assert_eq!(decoder.decode_next(), Ok(Some(Message::text("one"))));
        assert_eq!(decoder.decode_next(), Ok(Some(Message::text("two"))));
        assert_eq!(decoder.decode_next(), Ok(None));
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_frame_decoder_skips_unknown_kind() {
        let mut stream = vec![];
        stream.extend_from_slice(&FrameHeader { kind: 99, length: 2 }.to_bytes());
        stream.extend_from_slice(b"??");
        stream.extend(encode_message(&Message::text("after")).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert_eq!(decoder.decode_next(), Ok(Some(Message::text("after"))));
    }

    #[test]
    fn test_frame_decoder_rejects_header_over_limit() {
        let mut decoder = FrameDecoder::with_max_payload(4);
        decoder.extend(&FrameHeader { kind: 1, length: 5 }.to_bytes());
        assert_eq!(
            decoder.decode_next(),
            Err(ProtocolError::PayloadTooLarge { length: 5, max: 4 })
        );
    }

    #[test]
    fn test_frame_decoder_unbounded_limit_waits_on_maximum_length() {
        // Arrange
        let mut header = encode_frame(MessageKind::Message, b"").unwrap();
        header[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut decoder = FrameDecoder::with_max_payload(usize::MAX);

        // Act
        decoder.extend(&header);
        decoder.extend(b"partial");

        // Assert
        assert_eq!(decoder.decode_next(), Ok(None));
        assert_eq!(decoder.buffered(), HEADER_SIZE + 7);
    }

    #[test]
    fn test_finish_reports_truncated_frame() {
        let bytes = encode_message(&Message::text("truncated")).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes[..HEADER_SIZE + 3]);

        assert_eq!(decoder.decode_next(), Ok(None));
        assert_eq!(
            decoder.finish(),
            Err(ProtocolError::TruncatedFrame {
                buffered: HEADER_SIZE + 3
            })
        );
    }

    #[test]
    fn test_finish_on_empty_decoder_is_clean() {
        assert!(FrameDecoder::new().finish().is_ok());
    }
}
