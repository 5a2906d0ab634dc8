//! Pre-shared-key secure channel.
//!
//! Both peers hold the same [`SharedSecretMaterial`].  Neither sends the key;
//! each proves knowledge of it with an HMAC over fresh nonces, and the same
//! nonces feed the per-direction record keys.
//!
//! # Handshake
//!
//! ```text
//! initiator                                   responder
//!   [token_len:2][token][nonce_i:32]  ───►
//!                                      ◄───  [nonce_r:32][HMAC(k, "responder" ‖ ni ‖ nr)]
//!   [HMAC(k, "initiator" ‖ ni ‖ nr)]  ───►
//! ```
//!
//! A responder with a different passcode sends a proof the initiator rejects;
//! the initiator then drops the stream without sending its own proof, so the
//! responder sees end-of-stream and fails too.
//!
//! # Records
//!
//! ```text
//! [len:4][ChaCha20-Poly1305 ciphertext + tag:len]
//! ```
//! Each direction has its own key and a 64-bit counter nonce starting at 0.
//! A record carries at most [`MAX_RECORD_PLAINTEXT`] bytes of plaintext.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use lanchat_core::crypto::SharedSecretMaterial;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tracing::{debug, warn};

use super::{BoxedStream, TransportError, TransportParameters};

type HmacSha256 = Hmac<Sha256>;

/// Length of each handshake nonce.
pub const NONCE_LEN: usize = 32;

/// Largest plaintext carried by one record.
pub const MAX_RECORD_PLAINTEXT: usize = 64 * 1024;

const PROOF_LEN: usize = 32;
const TAG_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 4;
const MAX_TOKEN_LEN: usize = 255;
const READ_CHUNK: usize = 8 * 1024;

const RESPONDER_PROOF: &[u8] = b"lanchat responder proof";
const INITIATOR_PROOF: &[u8] = b"lanchat initiator proof";
const INITIATOR_TO_RESPONDER: &[u8] = b"lanchat initiator to responder";
const RESPONDER_TO_INITIATOR: &[u8] = b"lanchat responder to initiator";

/// Which side of the handshake this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection.
    Initiator,
    /// Accepted the connection.
    Responder,
}

/// An authenticated stream, ready to be split into its two directions.
pub struct SecureChannel {
    reader: SecureReader,
    writer: SecureWriter,
}

impl SecureChannel {
    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

struct SessionKeys {
    send: [u8; 32],
    receive: [u8; 32],
}

/// Runs the handshake over `stream` within `parameters.handshake_timeout`.
///
/// # Errors
///
/// - [`TransportError::AuthenticationFailed`] when the peers' passcodes differ.
/// - [`TransportError::UnknownIdentity`] when the initiator's token is not ours.
/// - [`TransportError::HandshakeTimeout`] when the exchange stalls.
/// - [`TransportError::Closed`] / [`TransportError::Io`] for stream failures.
pub async fn handshake(
    mut stream: BoxedStream,
    role: Role,
    parameters: &TransportParameters,
) -> Result<SecureChannel, TransportError> {
    let limit = parameters.handshake_timeout;
    let exchange = async {
        match role {
            Role::Initiator => initiate(&mut stream, &parameters.secret).await,
            Role::Responder => respond(&mut stream, &parameters.secret).await,
        }
    };
    let keys = tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| TransportError::HandshakeTimeout(limit))??;

    debug!("{role:?} handshake complete");
    let (read_half, write_half) = tokio::io::split(stream);
    Ok(SecureChannel {
        reader: SecureReader::new(read_half, &keys.receive),
        writer: SecureWriter::new(write_half, &keys.send),
    })
}

async fn initiate(
    stream: &mut BoxedStream,
    secret: &SharedSecretMaterial,
) -> Result<SessionKeys, TransportError> {
    let key = secret.authentication_key();
    let token = secret.verification_token();
    if token.len() > MAX_TOKEN_LEN {
        return Err(TransportError::UnknownIdentity);
    }

    let nonce_i = random_nonce();
    let mut hello = Vec::with_capacity(2 + token.len() + NONCE_LEN);
    hello.extend_from_slice(&(token.len() as u16).to_be_bytes());
    hello.extend_from_slice(token);
    hello.extend_from_slice(&nonce_i);
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut reply = [0u8; NONCE_LEN + PROOF_LEN];
    stream.read_exact(&mut reply).await?;
    let (nonce_r, proof) = reply.split_at(NONCE_LEN);

    if !verify_proof(key, RESPONDER_PROOF, &nonce_i, nonce_r, proof) {
        warn!("responder proof did not verify; passcodes differ");
        return Err(TransportError::AuthenticationFailed);
    }

    let own_proof = keyed_digest(key, INITIATOR_PROOF, &nonce_i, nonce_r);
    stream.write_all(&own_proof).await?;
    stream.flush().await?;

    Ok(SessionKeys {
        send: keyed_digest(key, INITIATOR_TO_RESPONDER, &nonce_i, nonce_r),
        receive: keyed_digest(key, RESPONDER_TO_INITIATOR, &nonce_i, nonce_r),
    })
}

async fn respond(
    stream: &mut BoxedStream,
    secret: &SharedSecretMaterial,
) -> Result<SessionKeys, TransportError> {
    let key = secret.authentication_key();

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let token_len = u16::from_be_bytes(len) as usize;
    if token_len > MAX_TOKEN_LEN {
        return Err(TransportError::UnknownIdentity);
    }
    let mut token = vec![0u8; token_len];
    stream.read_exact(&mut token).await?;
    let mut nonce_i = [0u8; NONCE_LEN];
    stream.read_exact(&mut nonce_i).await?;

    if token != secret.verification_token() {
        warn!(
            "initiator presented identity {:?}",
            String::from_utf8_lossy(&token)
        );
        return Err(TransportError::UnknownIdentity);
    }

    let nonce_r = random_nonce();
    let mut reply = Vec::with_capacity(NONCE_LEN + PROOF_LEN);
    reply.extend_from_slice(&nonce_r);
    reply.extend_from_slice(&keyed_digest(key, RESPONDER_PROOF, &nonce_i, &nonce_r));
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let mut proof = [0u8; PROOF_LEN];
    match stream.read_exact(&mut proof).await {
        Ok(_) => {}
        // The initiator hangs up instead of proving a key it does not have.
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
            ) =>
        {
            return Err(TransportError::AuthenticationFailed)
        }
        Err(e) => return Err(e.into()),
    }

    if !verify_proof(key, INITIATOR_PROOF, &nonce_i, &nonce_r, &proof) {
        warn!("initiator proof did not verify; passcodes differ");
        return Err(TransportError::AuthenticationFailed);
    }

    Ok(SessionKeys {
        send: keyed_digest(key, RESPONDER_TO_INITIATOR, &nonce_i, &nonce_r),
        receive: keyed_digest(key, INITIATOR_TO_RESPONDER, &nonce_i, &nonce_r),
    })
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn keyed_mac(key: &[u8], label: &[u8], nonce_i: &[u8], nonce_r: &[u8]) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC key length is valid");
    mac.update(label);
    mac.update(nonce_i);
    mac.update(nonce_r);
    mac
}

fn keyed_digest(key: &[u8], label: &[u8], nonce_i: &[u8], nonce_r: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&keyed_mac(key, label, nonce_i, nonce_r).finalize().into_bytes());
    out
}

/// Constant-time comparison of a received proof.
fn verify_proof(key: &[u8], label: &[u8], nonce_i: &[u8], nonce_r: &[u8], proof: &[u8]) -> bool {
    keyed_mac(key, label, nonce_i, nonce_r)
        .verify_slice(proof)
        .is_ok()
}

/// 12-byte AEAD nonce: 4 zero bytes then the big-endian record counter.
fn record_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

// ── Record reader ─────────────────────────────────────────────────────────────

/// Decrypting half of a [`SecureChannel`].
///
/// Implements [`AsyncRead`], yielding the concatenated plaintext of all
/// records.  A record that fails authentication surfaces as an [`io::Error`]
/// wrapping [`TransportError::RecordAuthentication`].
pub struct SecureReader {
    inner: ReadHalf<BoxedStream>,
    cipher: ChaCha20Poly1305,
    counter: u64,
    ciphertext: BytesMut,
    plaintext: BytesMut,
}

impl SecureReader {
    pub(crate) fn new(inner: ReadHalf<BoxedStream>, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
            ciphertext: BytesMut::with_capacity(READ_CHUNK),
            plaintext: BytesMut::new(),
        }
    }

    /// Opens the next complete record in the ciphertext buffer, if any.
    fn open_buffered(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(header) = self.ciphertext.get(..RECORD_HEADER_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_RECORD_PLAINTEXT + TAG_LEN {
            return Err(TransportError::RecordTooLarge(len));
        }
        if len < TAG_LEN {
            return Err(TransportError::RecordAuthentication);
        }
        if self.ciphertext.len() < RECORD_HEADER_LEN + len {
            return Ok(None);
        }

        self.ciphertext.advance(RECORD_HEADER_LEN);
        let sealed = self.ciphertext.split_to(len);
        let nonce = record_nonce(self.counter);
        self.counter += 1;

        self.cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map(Some)
            .map_err(|_| TransportError::RecordAuthentication)
    }
}

impl AsyncRead for SecureReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plaintext.is_empty() {
                let n = this.plaintext.len().min(buf.remaining());
                buf.put_slice(&this.plaintext[..n]);
                this.plaintext.advance(n);
                return Poll::Ready(Ok(()));
            }

            match this.open_buffered() {
                Ok(Some(plain)) => {
                    this.plaintext.extend_from_slice(&plain);
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(e.into_io())),
            }

            let mut scratch = [0u8; READ_CHUNK];
            let mut scratch_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut scratch_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let filled = scratch_buf.filled();
                    if filled.is_empty() {
                        if this.ciphertext.is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                        // Stream ended inside a record.
                        return Poll::Ready(Err(TransportError::Closed.into_io()));
                    }
                    this.ciphertext.extend_from_slice(filled);
                }
            }
        }
    }
}

// ── Record writer ─────────────────────────────────────────────────────────────

/// Encrypting half of a [`SecureChannel`].
pub struct SecureWriter {
    inner: WriteHalf<BoxedStream>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SecureWriter {
    pub(crate) fn new(inner: WriteHalf<BoxedStream>, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    /// Seals `data` into one or more records and writes them in a single
    /// `write_all`, so one call never interleaves with another.
    pub async fn write_sealed(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let records = data.len().div_ceil(MAX_RECORD_PLAINTEXT).max(1);
        let mut out = Vec::with_capacity(data.len() + records * (RECORD_HEADER_LEN + TAG_LEN));

        for chunk in data.chunks(MAX_RECORD_PLAINTEXT) {
            let nonce = record_nonce(self.counter);
            self.counter += 1;
            let sealed = self
                .cipher
                .encrypt(Nonce::from_slice(&nonce), chunk)
                .map_err(|_| TransportError::Io(io::Error::other("record encryption failed")))?;
            out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
            out.extend_from_slice(&sealed);
        }

        self.inner.write_all(&out).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Half-closes the write direction.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lanchat_core::crypto::SecretDeriver;

    use super::*;

    fn pipe() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (Box::new(a), Box::new(b))
    }

    async fn handshake_pair(
        initiator: TransportParameters,
        responder: TransportParameters,
    ) -> (
        Result<SecureChannel, TransportError>,
        Result<SecureChannel, TransportError>,
    ) {
        let (a, b) = pipe();
        tokio::join!(
            handshake(a, Role::Initiator, &initiator),
            handshake(b, Role::Responder, &responder)
        )
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_matching_passcodes_exchange_records_both_ways() {
        // Arrange
        let params = TransportParameters::with_passcode("hunter2");
        let (client, server) = handshake_pair(params.clone(), params).await;
        let (mut client_rx, mut client_tx) = client.expect("initiator handshake").into_split();
        let (mut server_rx, mut server_tx) = server.expect("responder handshake").into_split();

        // Act
        client_tx.write_sealed(b"ping").await.unwrap();
        server_tx.write_sealed(b"pong").await.unwrap();

        // Assert
        let mut buf = [0u8; 4];
        server_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_mismatched_passcodes_fail_on_both_sides() {
        // Arrange / Act
        let (client, server) = handshake_pair(
            TransportParameters::with_passcode("hunter2"),
            TransportParameters::with_passcode("wrong"),
        )
        .await;

        // Assert
        assert!(matches!(client, Err(TransportError::AuthenticationFailed)));
        assert!(matches!(server, Err(TransportError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_foreign_identity_is_rejected_by_responder() {
        // Arrange
        let initiator = TransportParameters::new(SecretDeriver::new("OtherApp").derive("hunter2"));
        let responder = TransportParameters::with_passcode("hunter2");

        // Act
        let (client, server) = handshake_pair(initiator, responder).await;

        // Assert
        assert!(matches!(server, Err(TransportError::UnknownIdentity)));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_silent_peer_hits_handshake_timeout() {
        // Arrange
        let mut params = TransportParameters::with_passcode("hunter2");
        params.handshake_timeout = Duration::from_millis(50);
        let (a, _silent) = pipe();

        // Act
        let result = handshake(a, Role::Responder, &params).await;

        // Assert
        assert!(matches!(result, Err(TransportError::HandshakeTimeout(_))));
    }

    // ── Records ───────────────────────────────────────────────────────────────

    const KEY: [u8; 32] = [7u8; 32];

    fn raw_reader() -> (tokio::io::DuplexStream, SecureReader) {
        let (raw, far) = tokio::io::duplex(256 * 1024);
        let (read_half, _write_half) = tokio::io::split(Box::new(far) as BoxedStream);
        (raw, SecureReader::new(read_half, &KEY))
    }

    fn seal(counter: u64, plaintext: &[u8]) -> Vec<u8> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&KEY));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&record_nonce(counter)), plaintext)
            .unwrap();
        let mut record = (sealed.len() as u32).to_be_bytes().to_vec();
        record.extend_from_slice(&sealed);
        record
    }

    #[tokio::test]
    async fn test_tampered_record_fails_authentication() {
        // Arrange
        let (mut raw, mut reader) = raw_reader();
        let mut record = seal(0, b"hello");
        record[RECORD_HEADER_LEN] ^= 0x01;

        // Act
        raw.write_all(&record).await.unwrap();
        let mut buf = [0u8; 5];
        let err = reader.read_exact(&mut buf).await.unwrap_err();

        // Assert
        assert!(matches!(TransportError::from(err), TransportError::RecordAuthentication));
    }

    #[tokio::test]
    async fn test_replayed_record_fails_authentication() {
        // Arrange
        let (mut raw, mut reader) = raw_reader();
        let record = seal(0, b"hello");

        // Act
        raw.write_all(&record).await.unwrap();
        raw.write_all(&record).await.unwrap();
        let mut first = [0u8; 5];
        reader.read_exact(&mut first).await.unwrap();
        let mut second = [0u8; 5];
        let err = reader.read_exact(&mut second).await.unwrap_err();

        // Assert
        assert_eq!(&first, b"hello");
        assert!(matches!(TransportError::from(err), TransportError::RecordAuthentication));
    }

    #[tokio::test]
    async fn test_oversized_record_header_is_rejected() {
        let (mut raw, mut reader) = raw_reader();
        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let mut buf = [0u8; 1];
        let err = reader.read_exact(&mut buf).await.unwrap_err();

        assert!(matches!(TransportError::from(err), TransportError::RecordTooLarge(_)));
    }

    #[tokio::test]
    async fn test_clean_eof_between_records_reads_zero() {
        let (mut raw, mut reader) = raw_reader();
        raw.write_all(&seal(0, b"ab")).await.unwrap();
        drop(raw);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"ab");
    }

    #[tokio::test]
    async fn test_large_write_is_split_into_records_and_reassembled() {
        // Arrange
        let params = TransportParameters::with_passcode("hunter2");
        let (client, server) = handshake_pair(params.clone(), params).await;
        let (_client_rx, mut client_tx) = client.unwrap().into_split();
        let (mut server_rx, _server_tx) = server.unwrap().into_split();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        // Act
        let writer = tokio::spawn(async move {
            client_tx.write_sealed(&payload).await.unwrap();
            payload
        });
        let mut received = vec![0u8; 200_000];
        server_rx.read_exact(&mut received).await.unwrap();

        // Assert
        assert_eq!(received, writer.await.unwrap());
    }
}
