//! Passive side of a chat: accepts TCP connections from browsing peers.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::infrastructure::storage::config::NetworkConfig;
use crate::infrastructure::transport::{tcp, IncomingStream, TransportError, TransportParameters};

/// A bound TCP listener carrying the transport parameters for every stream
/// it accepts.
pub struct PeerListener {
    listener: TcpListener,
    parameters: TransportParameters,
}

impl PeerListener {
    /// Binds to `config.bind_address:config.port` and derives the secret from
    /// `passcode`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the address cannot be bound.
    pub async fn bind(config: &NetworkConfig, passcode: &str) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let parameters = TransportParameters::from_config(config, passcode);

        info!("listening for peers on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            parameters,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next inbound connection.
    ///
    /// The returned stream is unauthenticated; `Connection::inbound` runs the
    /// handshake.
    pub async fn accept(&self) -> Result<IncomingStream, TransportError> {
        let (stream, remote_addr) = self.listener.accept().await?;
        tcp::configure_stream(&stream, &self.parameters)?;
        debug!("accepted connection from {remote_addr}");
        Ok(IncomingStream {
            stream: Box::new(stream),
            remote_addr: Some(remote_addr),
            parameters: self.parameters.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".into(),
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_on_port_zero_picks_a_port() {
        let listener = PeerListener::bind(&loopback(), "hunter2").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_accept_yields_stream_with_parameters() {
        // Arrange
        let listener = PeerListener::bind(&loopback(), "hunter2").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Act
        let (incoming, _client) =
            tokio::join!(listener.accept(), tokio::net::TcpStream::connect(addr));
        let incoming = incoming.unwrap();

        // Assert
        assert!(incoming.remote_addr.is_some());
        assert_eq!(incoming.parameters.secret, lanchat_core::derive("hunter2"));
    }

    #[tokio::test]
    async fn test_bind_to_invalid_address_fails() {
        let config = NetworkConfig {
            bind_address: "not-an-address".into(),
            ..NetworkConfig::default()
        };

        let result = PeerListener::bind(&config, "hunter2").await;

        assert!(matches!(result, Err(TransportError::BindFailed { .. })));
    }
}
