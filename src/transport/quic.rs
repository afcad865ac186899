//! QUIC transport
//!
//! One bidirectional QUIC stream per logical stream, multiplexed over a
//! [`SlotPool`] of QUIC connections. TLS 1.3 with mutual authentication and
//! ALPN `tunnelrat`; idle connections are kept alive by the QUIC runtime.

use super::{BoxStream, StreamOpener};
use crate::config::{PoolConfig, TlsConfig, TransportKind};
use crate::error::{PoolError, TunnelError};
use crate::pool::{ConnState, Connector, PhysicalConn, SlotPool};
use crate::protocol::Address;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, TransportConfig, VarInt};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Idle timeout as a multiple of the keep-alive interval
const IDLE_FACTOR: u32 = 3;

/// Keep-alive interval actually used; zero would disable keep-alive
fn effective_keepalive(keepalive: Duration) -> Duration {
    if keepalive.is_zero() {
        Duration::from_secs(15)
    } else {
        keepalive
    }
}

/// Transport parameters shared by both sides
pub fn transport_config(keepalive: Duration) -> Arc<TransportConfig> {
    let mut config = TransportConfig::default();
    let keepalive = effective_keepalive(keepalive);
    let idle_ms = (keepalive * IDLE_FACTOR).as_millis().min(u32::MAX as u128) as u32;

    config
        .max_concurrent_bidi_streams(VarInt::from_u32(1024))
        .max_concurrent_uni_streams(VarInt::from_u32(0))
        .keep_alive_interval(Some(keepalive))
        .max_idle_timeout(Some(VarInt::from_u32(idle_ms).into()));

    Arc::new(config)
}

/// Client-side QUIC config with the client certificate from `tls`
pub fn client_config(tls: &TlsConfig, keepalive: Duration) -> Result<quinn::ClientConfig> {
    let rustls = crate::tls::client_config(tls, &[crate::tls::ALPN_QUIC])?;
    let crypto = QuicClientConfig::try_from(rustls).context("TLS config unusable for QUIC")?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config(keepalive));
    Ok(config)
}

/// Server-side QUIC config requiring a client certificate
pub fn server_config(tls: &TlsConfig, keepalive: Duration) -> Result<quinn::ServerConfig> {
    let rustls = crate::tls::server_config(tls, &[crate::tls::ALPN_QUIC])?;
    let crypto = QuicServerConfig::try_from(rustls).context("TLS config unusable for QUIC")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config(keepalive));
    Ok(config)
}

/// Pooled QUIC connection
#[derive(Clone, Debug)]
pub struct QuicConn {
    conn: quinn::Connection,
    /// Keeps the UDP socket alive as long as the connection
    _endpoint: Endpoint,
}

impl QuicConn {
    /// Open a new bidirectional stream
    pub async fn open(&self) -> Result<QuicStream, TunnelError> {
        match self.conn.open_bi().await {
            Ok((send, recv)) => Ok(QuicStream::new(send, recv)),
            Err(e) if !self.is_ready() => Err(PoolError::Transient(e.to_string()).into()),
            Err(e) => Err(TunnelError::Transport(format!("open QUIC stream: {}", e))),
        }
    }
}

impl PhysicalConn for QuicConn {
    fn state(&self) -> ConnState {
        match self.conn.close_reason() {
            None => ConnState::Ready,
            Some(ConnectionError::LocallyClosed)
            | Some(ConnectionError::ApplicationClosed(_))
            | Some(ConnectionError::ConnectionClosed(_)) => ConnState::Shutdown,
            Some(_) => ConnState::Dead,
        }
    }

    fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"close");
    }
}

/// One bidirectional QUIC stream
#[derive(Debug)]
pub struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl QuicStream {
    /// Join the halves of a bidirectional stream
    pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        QuicStream { send, recv }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Dials QUIC connections for the pool; each gets its own UDP socket
pub struct QuicConnector {
    remote: Address,
    server_name: String,
    config: quinn::ClientConfig,
}

#[async_trait]
impl Connector for QuicConnector {
    type Conn = QuicConn;

    async fn connect(&self) -> Result<QuicConn> {
        let addr = self
            .remote
            .resolve()
            .await
            .with_context(|| format!("Failed to resolve {}", self.remote))?;
        let bind: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let endpoint = Endpoint::client(bind).context("Failed to bind QUIC endpoint")?;
        let conn = endpoint
            .connect_with(self.config.clone(), addr, &self.server_name)
            .context("Invalid QUIC connect parameters")?
            .await
            .with_context(|| format!("QUIC handshake with {} failed", self.remote))?;

        debug!("QUIC connection established to {}", self.remote);
        Ok(QuicConn {
            conn,
            _endpoint: endpoint,
        })
    }

    fn remote(&self) -> String {
        self.remote.to_string()
    }
}

/// Opens QUIC streams on pooled connections
pub struct QuicOpener {
    pool: Arc<SlotPool<QuicConnector>>,
}

impl QuicOpener {
    /// Create an opener; connections are dialed on first use
    pub fn new(remote: Address, tls: &TlsConfig, pool: PoolConfig) -> Result<Self> {
        let config = client_config(tls, pool.keepalive_interval())?;
        let server_name = tls.server_name.clone().unwrap_or_else(|| remote.host());
        let connector = QuicConnector {
            remote,
            server_name,
            config,
        };
        Ok(QuicOpener {
            pool: SlotPool::new(connector, pool),
        })
    }

    /// Pool backing this opener
    pub fn pool(&self) -> &Arc<SlotPool<QuicConnector>> {
        &self.pool
    }
}

#[async_trait]
impl StreamOpener for QuicOpener {
    async fn open(&self, _dst: &Address) -> Result<BoxStream, TunnelError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(conn.open().await?))
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }
}
