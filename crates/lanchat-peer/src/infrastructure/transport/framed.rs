//! Turns an [`AsyncRead`] byte stream into a lazy sequence of [`Message`]s.

use bytes::BytesMut;
use lanchat_core::protocol::{FrameDecoder, Message, DEFAULT_MAX_PAYLOAD};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::TransportError;

const READ_CHUNK: usize = 8 * 1024;

/// Reads framed messages from `R`.
///
/// [`MessageReader::next_message`] is cancel-safe: all partial state lives in
/// the reader, and the only await point is a `read_buf`, so dropping the
/// future inside `tokio::select!` loses no bytes.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: FrameDecoder::with_max_payload(max_payload),
        }
    }

    /// Waits for the next message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    ///
    /// # Errors
    ///
    /// - `Protocol(TruncatedFrame)` if the stream ended mid-frame.
    /// - `Protocol(..)` for oversized or malformed frames.
    /// - Any transport error raised by the underlying stream.
    ///
    /// All errors are terminal for the stream.
    pub async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some(msg) = self.decoder.decode_next()? {
                return Ok(Some(msg));
            }

            self.buf.clear();
            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lanchat_core::protocol::{encode_frame, encode_message, MessageKind, ProtocolError};
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    use super::*;

    #[tokio::test]
    async fn test_message_split_across_reads_is_reassembled() {
        // Arrange
        let bytes = encode_message(&Message::text("hello")).unwrap();
        let mock = Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..9])
            .read(&bytes[9..])
            .build();
        let mut reader = MessageReader::new(mock);

        // Act
        let first = reader.next_message().await.unwrap();
        let end = reader.next_message().await.unwrap();

        // Assert
        assert_eq!(first, Some(Message::text("hello")));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_several_messages_in_one_read_are_yielded_in_order() {
        // Arrange
        let mut bytes = encode_message(&Message::control(MessageKind::Join)).unwrap();
        bytes.extend(encode_message(&Message::text("a")).unwrap());
        bytes.extend(encode_message(&Message::text("b")).unwrap());
        let mut reader = MessageReader::new(Builder::new().read(&bytes).build());

        // Act
        let mut got = Vec::new();
        while let Some(msg) = reader.next_message().await.unwrap() {
            got.push(msg);
        }

        // Assert
        assert_eq!(
            got,
            vec![
                Message::control(MessageKind::Join),
                Message::text("a"),
                Message::text("b"),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_ending_mid_frame_is_truncated() {
        let bytes = encode_message(&Message::text("0123456789")).unwrap();
        let mut reader = MessageReader::new(Builder::new().read(&bytes[..12]).build());

        let err = reader.next_message().await.unwrap_err();

        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::TruncatedFrame { buffered: 12 })
        ));
    }

    #[tokio::test]
    async fn test_empty_stream_ends_cleanly() {
        let mut reader = MessageReader::new(Builder::new().build());
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_skipped() {
        // Arrange
        let mut bytes = 99u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(b"xyz");
        bytes.extend(encode_frame(MessageKind::Message, b"kept").unwrap());
        let mut reader = MessageReader::new(Builder::new().read(&bytes).build());

        // Act / Assert
        assert_eq!(reader.next_message().await.unwrap(), Some(Message::text("kept")));
    }

    #[tokio::test]
    async fn test_oversized_header_fails_before_payload_arrives() {
        let mut header = 1u32.to_be_bytes().to_vec();
        header.extend_from_slice(&1_000u32.to_be_bytes());
        let mut reader = MessageReader::with_max_payload(Builder::new().read(&header).build(), 100);

        let err = reader.next_message().await.unwrap_err();

        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::PayloadTooLarge { length: 1_000, max: 100 })
        ));
    }

    #[tokio::test]
    async fn test_next_message_survives_cancellation_in_select() {
        // Arrange
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(rx);
        let bytes = encode_message(&Message::text("after the timeout")).unwrap();

        // Act: first half arrives, then the read is cancelled by a timer.
        tx.write_all(&bytes[..6]).await.unwrap();
        tokio::select! {
            _ = reader.next_message() => panic!("message must not be complete yet"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        tx.write_all(&bytes[6..]).await.unwrap();
        let msg = reader.next_message().await.unwrap();

        // Assert
        assert_eq!(msg, Some(Message::text("after the timeout")));
    }
}
