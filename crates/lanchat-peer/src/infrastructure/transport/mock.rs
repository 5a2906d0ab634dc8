//! In-memory connectors for unit and integration testing.
//!
//! [`MemoryConnector`] hands the client half of a `tokio::io::duplex` pipe to
//! the caller and the server half to an "accept" channel, so both ends of a
//! connection can be driven without sockets.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BoxedStream, Connector, PeerEndpoint, TransportError, TransportParameters};

const PIPE_CAPACITY: usize = 64 * 1024;

/// A [`Connector`] backed by in-memory pipes.
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<BoxedStream>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    /// Creates a connector and the receiver on which server halves arrive.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BoxedStream>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Self {
            accept_tx,
            connects: AtomicUsize::new(0),
        };
        (connector, accept_rx)
    }

    /// Number of `connect` calls made so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        _parameters: &TransportParameters,
    ) -> Result<BoxedStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.accept_tx
            .send(Box::new(server))
            .map_err(|_| TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener dropped"),
            })?;
        Ok(Box::new(client))
    }
}

/// A [`Connector`] whose every attempt fails with the given I/O error kind.
#[derive(Debug, Clone, Copy)]
pub struct FailingConnector {
    kind: io::ErrorKind,
}

impl FailingConnector {
    pub fn new(kind: io::ErrorKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        _parameters: &TransportParameters,
    ) -> Result<BoxedStream, TransportError> {
        Err(TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            source: io::Error::from(self.kind),
        })
    }
}
