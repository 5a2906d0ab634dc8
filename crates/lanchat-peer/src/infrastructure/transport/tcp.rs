//! TCP implementation of [`Connector`].

use std::io;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{BoxedStream, Connector, PeerEndpoint, TransportError, TransportParameters};

/// Connects over TCP, trying each endpoint address in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        parameters: &TransportParameters,
    ) -> Result<BoxedStream, TransportError> {
        let addresses = endpoint.addresses();
        if addresses.is_empty() {
            return Err(TransportError::NoAddress(endpoint.to_string()));
        }

        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no address attempted");
        for addr in addresses {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    configure_stream(&stream, parameters)?;
                    info!("connected to {endpoint} via {addr}");
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_error = e;
                }
            }
        }

        Err(TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            source: last_error,
        })
    }
}

/// Applies keepalive and no-delay to a connected socket.
///
/// Keepalive probes start after `parameters.keepalive_idle` of silence, which
/// is how a dead peer is noticed; there are no application-level pings.
pub fn configure_stream(stream: &TcpStream, parameters: &TransportParameters) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(parameters.keepalive_idle);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_reaches_local_listener() {
        // Arrange
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = PeerEndpoint::Address(addr);
        let params = TransportParameters::with_passcode("hunter2");

        // Act
        let (connected, accepted) =
            tokio::join!(TcpConnector.connect(&endpoint, &params), listener.accept());

        // Assert
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_service_without_addresses_is_no_address() {
        let endpoint = PeerEndpoint::Service {
            name: "ghost".into(),
            service_type: "_lanchat._tcp.local.".into(),
            addresses: vec![],
        };
        let params = TransportParameters::with_passcode("hunter2");

        let result = TcpConnector.connect(&endpoint, &params).await;

        assert!(matches!(result, Err(TransportError::NoAddress(_))));
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        // Arrange: bind then drop so the port is very likely closed.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let params = TransportParameters::with_passcode("hunter2");

        // Act
        let result = TcpConnector
            .connect(&PeerEndpoint::Address(addr), &params)
            .await;

        // Assert
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }
}
