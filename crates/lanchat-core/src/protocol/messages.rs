//! Chat protocol message types.
//!
//! Every unit on the wire is a [`Message`]: a [`MessageKind`] tag plus an
//! optional UTF-8 payload.  Only [`MessageKind::Message`] carries a payload;
//! the other kinds are control signals used to announce joining or leaving a
//! chat room.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Total size of the frame header in bytes (`kind:4` + `length:4`).
pub const HEADER_SIZE: usize = 8;

/// Largest payload the header's 32-bit length field can describe.
pub const MAX_ENCODABLE_PAYLOAD: usize = u32::MAX as usize;

/// Default upper bound on a payload accepted by the decoder (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// ── Message kinds ─────────────────────────────────────────────────────────────

/// The closed set of message kinds.
///
/// The numeric values are the interop contract between peers: there is no
/// version negotiation, so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageKind {
    /// A chat line carrying UTF-8 text.
    Message = 1,
    /// The sender entered the chat room.
    Join = 2,
    /// The sender left the chat room.
    Leave = 3,
    /// The sender is tearing the connection down.
    Cancel = 4,
}

impl MessageKind {
    /// Returns `true` for the kinds that carry a payload.
    pub fn carries_payload(self) -> bool {
        matches!(self, MessageKind::Message)
    }

    /// Returns `true` for `Join`, `Leave` and `Cancel`.
    pub fn is_control(self) -> bool {
        !self.carries_payload()
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            1 => Ok(MessageKind::Message),
            2 => Ok(MessageKind::Join),
            3 => Ok(MessageKind::Leave),
            4 => Ok(MessageKind::Cancel),
            _ => Err(()),
        }
    }
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// 8-byte header written before every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw kind tag.  Kept as the wire integer so unknown kinds can be skipped.
    pub kind: u32,
    /// Exact number of payload bytes following the header.
    pub length: u32,
}

impl FrameHeader {
    /// Serialises the header as big-endian bytes.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.kind.to_be_bytes());
        out[4..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Reads a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Returns `None` when fewer than [`HEADER_SIZE`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let kind = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some(Self { kind, length })
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One decoded application message.
///
/// Use [`Message::text`] or [`Message::control`] to build one; both keep the
/// payload consistent with the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    kind: MessageKind,
    payload: Option<String>,
}

impl Message {
    /// A `Message`-kind unit carrying `text` (which may be empty).
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Message,
            payload: Some(text.into()),
        }
    }

    /// A control unit without payload.
    ///
    /// Passing [`MessageKind::Message`] yields an empty text message, since a
    /// `Message`-kind unit always carries a payload.
    pub fn control(kind: MessageKind) -> Self {
        if kind.carries_payload() {
            return Self::text(String::new());
        }
        Self {
            kind,
            payload: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The text payload; `None` for control kinds.
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Splits the message into its parts.
    pub fn into_parts(self) -> (Option<String>, MessageKind) {
        (self.payload, self.kind)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_wire_values_are_stable() {
        assert_eq!(MessageKind::Message as u32, 1);
        assert_eq!(MessageKind::Join as u32, 2);
        assert_eq!(MessageKind::Leave as u32, 3);
        assert_eq!(MessageKind::Cancel as u32, 4);
    }

    #[test]
    fn test_message_kind_try_from_round_trips_every_kind() {
        for kind in [
            MessageKind::Message,
            MessageKind::Join,
            MessageKind::Leave,
            MessageKind::Cancel,
        ] {
            assert_eq!(MessageKind::try_from(kind as u32), Ok(kind));
        }
    }

    #[test]
    fn test_message_kind_try_from_rejects_unknown_values() {
        assert!(MessageKind::try_from(0).is_err());
        assert!(MessageKind::try_from(5).is_err());
        assert!(MessageKind::try_from(u32::MAX).is_err());
    }

    #[test]
    fn test_only_message_kind_carries_payload() {
        assert!(MessageKind::Message.carries_payload());
        assert!(MessageKind::Join.is_control());
        assert!(MessageKind::Leave.is_control());
        assert!(MessageKind::Cancel.is_control());
    }

    #[test]
    fn test_control_constructor_has_no_payload() {
        let msg = Message::control(MessageKind::Leave);
        assert_eq!(msg.kind(), MessageKind::Leave);
        assert_eq!(msg.payload(), None);
    }

    #[test]
    fn test_control_constructor_with_message_kind_yields_empty_text() {
        let msg = Message::control(MessageKind::Message);
        assert_eq!(msg, Message::text(""));
    }

    #[test]
    fn test_header_bytes_are_big_endian() {
        let header = FrameHeader {
            kind: 0x0102_0304,
            length: 0x0A0B_0C0D,
        };
        assert_eq!(
            header.to_bytes(),
            [0x01, 0x02, 0x03, 0x04, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(FrameHeader::parse(&header.to_bytes()), Some(header));
    }

    #[test]
    fn test_header_parse_needs_eight_bytes() {
        assert_eq!(FrameHeader::parse(&[0u8; 7]), None);
    }
}
