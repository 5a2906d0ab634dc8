//! Transport infrastructure: byte streams between two peers.
//!
//! The application layer never touches sockets directly.  It asks a
//! [`Connector`] for a raw stream to a [`PeerEndpoint`], runs the
//! [`secure`] handshake over it, and reads framed messages through a
//! [`framed::MessageReader`].
//!
//! # Testability
//!
//! The `Connector` trait lets tests swap TCP for in-memory duplex pipes
//! (see [`mock`]) so a full handshake and message exchange runs without
//! opening a socket.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use lanchat_core::crypto::{derive, SharedSecretMaterial};
use lanchat_core::protocol::{ProtocolError, DEFAULT_MAX_PAYLOAD};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::infrastructure::discovery::{instance_name, PeerRecord};
use crate::infrastructure::storage::config::NetworkConfig;

pub mod framed;
pub mod mock;
pub mod secure;
pub mod tcp;

/// Default bound on the whole pre-shared-key handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle time before TCP keepalive probes start.
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(2);

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection could be opened to any address of the endpoint.
    #[error("could not reach {endpoint}: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The endpoint has no address to connect to.
    #[error("no usable address for {0}")]
    NoAddress(String),

    /// The listening socket could not be bound.
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred on an established stream.
    #[error("connection I/O error: {0}")]
    Io(io::Error),

    /// The remote side closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// The peer does not know the same passcode.
    #[error("pre-shared key authentication failed")]
    AuthenticationFailed,

    /// The peer presented a verification token this side does not accept.
    #[error("peer presented an unknown identity")]
    UnknownIdentity,

    /// A record failed AEAD authentication.
    #[error("record failed authentication")]
    RecordAuthentication,

    /// A record header announced more ciphertext than allowed.
    #[error("record of {0} bytes exceeds the limit")]
    RecordTooLarge(usize),

    /// The handshake did not complete in time.
    #[error("handshake did not finish within {0:?}")]
    HandshakeTimeout(Duration),

    /// The framed byte stream was invalid.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<io::Error> for TransportError {
    /// Unwraps a `TransportError` tunnelled through an [`io::Error`] by the
    /// record reader; anything else becomes [`TransportError::Io`].
    fn from(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<TransportError>()) {
            return match e.into_inner().map(|inner| inner.downcast::<TransportError>()) {
                Some(Ok(transport)) => *transport,
                _ => TransportError::Io(io::Error::other("tunnelled transport error was lost")),
            };
        }
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return TransportError::Closed;
        }
        TransportError::Io(e)
    }
}

impl TransportError {
    /// Wraps `self` in an [`io::Error`] so it can cross an `AsyncRead` boundary.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// Any bidirectional byte stream a [`Connector`] can hand out.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A type-erased raw stream, before the handshake.
pub type BoxedStream = Box<dyn AsyncStream>;

// ── Endpoints ─────────────────────────────────────────────────────────────────

/// Where an outbound connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEndpoint {
    /// A peer found by service browsing.
    Service {
        name: String,
        service_type: String,
        addresses: Vec<SocketAddr>,
    },
    /// A manually entered host and port.
    Address(SocketAddr),
}

impl PeerEndpoint {
    /// Builds a service endpoint for a discovered peer.
    ///
    /// The name is the instance part of the record's full service name, not
    /// the display name.
    pub fn from_record(record: &PeerRecord, service_type: &str) -> Self {
        PeerEndpoint::Service {
            name: instance_name(record.id.as_str(), service_type).to_string(),
            service_type: service_type.to_string(),
            addresses: record.interfaces.clone(),
        }
    }

    /// The advertised service name, if this endpoint came from browsing.
    pub fn service_name(&self) -> Option<&str> {
        match self {
            PeerEndpoint::Service { name, .. } => Some(name),
            PeerEndpoint::Address(_) => None,
        }
    }

    /// Addresses to try, in preference order.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        match self {
            PeerEndpoint::Service { addresses, .. } => addresses.clone(),
            PeerEndpoint::Address(addr) => vec![*addr],
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEndpoint::Service {
                name, service_type, ..
            } => write!(f, "{name}.{service_type}"),
            PeerEndpoint::Address(addr) => write!(f, "{addr}"),
        }
    }
}

// ── Parameters ────────────────────────────────────────────────────────────────

/// Settings applied to every stream: the passcode-derived secret plus
/// timeouts and limits.
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub secret: SharedSecretMaterial,
    pub handshake_timeout: Duration,
    pub keepalive_idle: Duration,
    pub max_payload: usize,
}

impl TransportParameters {
    /// Parameters with default timeouts for already derived key material.
    pub fn new(secret: SharedSecretMaterial) -> Self {
        Self {
            secret,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive_idle: DEFAULT_KEEPALIVE_IDLE,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Derives the secret from `passcode` and uses default timeouts.
    pub fn with_passcode(passcode: &str) -> Self {
        Self::new(derive(passcode))
    }

    /// Derives the secret from `passcode` and takes limits from `config`.
    pub fn from_config(config: &NetworkConfig, passcode: &str) -> Self {
        Self {
            secret: derive(passcode),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            keepalive_idle: Duration::from_secs(config.keepalive_idle_secs),
            max_payload: config.max_payload_bytes,
        }
    }
}

/// An accepted stream waiting to be wrapped in a `Connection`.
pub struct IncomingStream {
    pub stream: BoxedStream,
    pub remote_addr: Option<SocketAddr>,
    pub parameters: TransportParameters,
}

impl fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingStream")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

// ── Connector trait ───────────────────────────────────────────────────────────

/// Opens raw streams to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `endpoint`.  The returned stream has not been authenticated.
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        parameters: &TransportParameters,
    ) -> Result<BoxedStream, TransportError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
