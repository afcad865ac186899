//! TCP transport implementation
//!
//! Plain TCP, one connection to the tunnel server per logical stream.

use super::{connect_tcp, BoxStream, SocketOpts, StreamOpener};
use crate::config::TransportKind;
use crate::error::TunnelError;
use crate::protocol::Address;
use async_trait::async_trait;
use std::time::Duration;

/// Opens one TCP connection per logical stream
#[derive(Debug, Clone)]
pub struct TcpOpener {
    remote: Address,
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl TcpOpener {
    /// Create an opener for the tunnel server at `remote`
    pub fn new(remote: Address, socket_opts: SocketOpts, connect_timeout: Duration) -> Self {
        TcpOpener {
            remote,
            socket_opts,
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamOpener for TcpOpener {
    async fn open(&self, _dst: &Address) -> Result<BoxStream, TunnelError> {
        let stream = connect_tcp(&self.remote, &self.socket_opts, self.connect_timeout).await?;
        tracing::debug!("TCP connection established to {}", self.remote);
        Ok(Box::new(stream))
    }

    async fn close(&self) {}

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}
