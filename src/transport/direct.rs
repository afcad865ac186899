//! Built-in `direct` and `reject` outbounds

use super::{connect_tcp, BoxStream, SocketOpts, StreamDialer};
use crate::error::TunnelError;
use crate::protocol::Address;
use async_trait::async_trait;
use std::time::Duration;

/// Connects straight to the destination
#[derive(Debug, Clone)]
pub struct DirectDialer {
    socket_opts: SocketOpts,
    connect_timeout: Duration,
}

impl DirectDialer {
    /// Create a dialer bounded by `connect_timeout`
    pub fn new(socket_opts: SocketOpts, connect_timeout: Duration) -> Self {
        DirectDialer {
            socket_opts,
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamDialer for DirectDialer {
    async fn dial(&self, dst: &Address) -> Result<BoxStream, TunnelError> {
        let stream = connect_tcp(dst, &self.socket_opts, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {}
}

/// Refuses every destination
#[derive(Debug, Clone, Default)]
pub struct RejectDialer;

#[async_trait]
impl StreamDialer for RejectDialer {
    async fn dial(&self, dst: &Address) -> Result<BoxStream, TunnelError> {
        Err(TunnelError::Rejected(dst.to_string()))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_dialer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = Address::from(listener.local_addr().unwrap());
        let dialer = DirectDialer::new(SocketOpts::default(), Duration::from_secs(1));
        let (stream, accepted) = tokio::join!(dialer.dial(&dst), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_reject_dialer() {
        let dst = Address::parse("example.com:443").unwrap();
        let err = RejectDialer.dial(&dst).await.unwrap_err();
        assert!(matches!(err, TunnelError::Rejected(ref s) if s == "example.com:443"));
    }
}
