//! TLS transport implementation
//!
//! Mutual TLS over TCP using rustls, one connection per logical stream.

use super::{connect_tcp, BoxStream, SocketOpts, StreamOpener};
use crate::config::{TlsConfig, TransportKind};
use crate::error::TunnelError;
use crate::protocol::Address;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// TLS stream type alias
pub type TlsStream = tokio_rustls::client::TlsStream<tokio::net::TcpStream>;

/// Opens one mutual-TLS connection per logical stream
#[derive(Clone)]
pub struct TlsOpener {
    remote: Address,
    /// TLS connector
    connector: TlsConnector,
    /// Server name for verification
    server_name: ServerName<'static>,
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl std::fmt::Debug for TlsOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOpener")
            .field("remote", &self.remote)
            .field("server_name", &self.server_name)
            .field("socket_opts", &self.socket_opts)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TlsOpener {
    /// Create an opener presenting the client certificate from `tls`
    pub fn new(
        remote: Address,
        tls: &TlsConfig,
        socket_opts: SocketOpts,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let config = crate::tls::client_config(tls, &[])?;
        let server_name = crate::tls::server_name(tls, &remote)?;

        Ok(TlsOpener {
            remote,
            connector: TlsConnector::from(config),
            server_name,
            socket_opts,
            connect_timeout,
        })
    }

    /// Dial and complete the TLS handshake
    pub async fn connect(&self) -> Result<TlsStream, TunnelError> {
        let tcp_stream = connect_tcp(&self.remote, &self.socket_opts, self.connect_timeout).await?;

        let handshake = self.connector.connect(self.server_name.clone(), tcp_stream);
        let tls_stream = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TunnelError::Timeout(format!("TLS handshake with {}", self.remote)))?
            .map_err(|e| TunnelError::Transport(format!("TLS handshake with {}: {}", self.remote, e)))?;

        tracing::debug!("TLS connection established to {}", self.remote);
        Ok(tls_stream)
    }
}

#[async_trait]
impl StreamOpener for TlsOpener {
    async fn open(&self, _dst: &Address) -> Result<BoxStream, TunnelError> {
        Ok(Box::new(self.connect().await?))
    }

    async fn close(&self) {}

    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }
}
