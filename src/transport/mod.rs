//! Transport module for Tunnelrat
//!
//! A [`StreamDialer`] turns a destination into a ready duplex stream. The
//! tunnel dialers share one shape: a backend-specific [`StreamOpener`]
//! produces a logical stream to the tunnel server, and [`TunnelDialer`]
//! writes the tunnel header on it before handing it out.
//!
//! Backends:
//! - `tcp`: one plain TCP connection per stream
//! - `tls`: one mutual-TLS connection per stream
//! - `grpc`: bidirectional gRPC calls over a [`SlotPool`] of HTTP/2 connections
//! - `quic`: bidirectional QUIC streams over a [`SlotPool`] of QUIC connections
//! - `http2`: CONNECT requests over a [`RefCountPool`] of HTTP/2 clients
//!
//! An outbound with several server addresses becomes a [`DialerGroup`] of
//! such dialers.
//!
//! [`SlotPool`]: crate::pool::SlotPool
//! [`RefCountPool`]: crate::pool::RefCountPool

mod direct;
mod group;
pub mod grpc;
pub(crate) mod h2;
pub mod http2;
#[cfg(feature = "quic")]
pub mod quic;
mod tcp;
mod tls;

pub use direct::{DirectDialer, RejectDialer};
pub use group::{DialerGroup, GroupMember, HealthCheck};
pub use grpc::GrpcOpener;
pub use http2::Http2Opener;
#[cfg(feature = "quic")]
pub use quic::QuicOpener;
pub use tcp::TcpOpener;
pub use tls::TlsOpener;

use crate::config::{TcpConfig, TransportKind, TunnelClientConfig};
use crate::error::TunnelError;
use crate::protocol::{Address, TunnelHeader};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Resolve and connect to `addr` within `timeout`, then apply `opts`
pub async fn connect_tcp(
    addr: &Address,
    opts: &SocketOpts,
    timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    let connect = async {
        let resolved = addr.resolve().await?;
        TcpStream::connect(resolved).await
    };

    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| TunnelError::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| TunnelError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    opts.apply(&stream)?;
    Ok(stream)
}

/// Dynamic stream trait for boxed streams
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> StreamDyn for T {}

/// A logical duplex stream
pub type BoxStream = Box<dyn StreamDyn>;

/// Produces ready-to-use streams towards a destination
#[async_trait]
pub trait StreamDialer: Send + Sync {
    /// Open a stream to `dst`. For tunnel dialers the tunnel header has
    /// already been written when this returns.
    async fn dial(&self, dst: &Address) -> Result<BoxStream, TunnelError>;

    /// Close every physical connection; open streams fail on their next I/O
    async fn close(&self);
}

/// Opens raw logical streams to a tunnel server
#[async_trait]
pub trait StreamOpener: Send + Sync + 'static {
    /// Open a new logical stream. `dst` is only informational for most
    /// backends; the tunnel header carries it.
    async fn open(&self, dst: &Address) -> Result<BoxStream, TunnelError>;

    /// Close pooled physical connections
    async fn close(&self);

    /// Backend name, for logging
    fn kind(&self) -> TransportKind;
}

/// Dialer that prefixes every stream from `O` with the tunnel header
pub struct TunnelDialer<O> {
    opener: O,
    dial_timeout: Duration,
}

impl<O: StreamOpener> TunnelDialer<O> {
    /// Create a dialer bounded by `dial_timeout`
    pub fn new(opener: O, dial_timeout: Duration) -> Self {
        TunnelDialer {
            opener,
            dial_timeout,
        }
    }

    async fn open_with_retry(&self, dst: &Address) -> Result<BoxStream, TunnelError> {
        match self.opener.open(dst).await {
            Err(TunnelError::Pool(e)) if e.is_transient() => {
                debug!("{} transient error ({}), retrying once", self.opener.kind(), e);
                self.opener.open(dst).await
            }
            result => result,
        }
    }
}

#[async_trait]
impl<O: StreamOpener> StreamDialer for TunnelDialer<O> {
    async fn dial(&self, dst: &Address) -> Result<BoxStream, TunnelError> {
        let header = TunnelHeader::new(dst.clone());
        let open = async {
            let mut stream = self.open_with_retry(dst).await?;
            header.write_to(&mut stream).await?;
            Ok::<_, TunnelError>(stream)
        };

        tokio::time::timeout(self.dial_timeout, open)
            .await
            .map_err(|_| {
                TunnelError::Timeout(format!("{} dial to {}", self.opener.kind(), dst))
            })?
    }

    async fn close(&self) {
        self.opener.close().await;
    }
}

/// Build the dialer for one configured tunnel client. Several addresses
/// yield a [`DialerGroup`] with one dialer per server.
pub fn create_dialer(config: &TunnelClientConfig) -> Result<Arc<dyn StreamDialer>> {
    if !config.is_group() {
        return create_server_dialer(config, &config.address);
    }

    let check = HealthCheck::from_config(&config.health_check)?;
    let members = config
        .all_addresses()
        .map(|address| {
            Ok(GroupMember {
                address: address.to_string(),
                dialer: create_server_dialer(config, address)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let group: Arc<dyn StreamDialer> = DialerGroup::new(config.tag.clone(), members, check);
    Ok(group)
}

fn create_server_dialer(
    config: &TunnelClientConfig,
    address: &str,
) -> Result<Arc<dyn StreamDialer>> {
    let remote = Address::parse(address)
        .with_context(|| format!("Invalid tunnel address: {}", address))?;
    let opts = SocketOpts::from_tcp_config(&config.tcp);
    let pool = config.effective_pool();
    let dial_timeout = config.dial_timeout();

    let dialer: Arc<dyn StreamDialer> = match config.transport {
        TransportKind::Tcp => Arc::new(TunnelDialer::new(
            TcpOpener::new(remote, opts, pool.connect_timeout()),
            dial_timeout,
        )),
        TransportKind::Tls => {
            let tls = require_tls(config)?;
            Arc::new(TunnelDialer::new(
                TlsOpener::new(remote, tls, opts, pool.connect_timeout())?,
                dial_timeout,
            ))
        }
        TransportKind::Grpc => {
            let tls = require_tls(config)?;
            Arc::new(TunnelDialer::new(
                GrpcOpener::new(remote, tls, opts, pool)?,
                dial_timeout,
            ))
        }
        TransportKind::Http2 => {
            let tls = require_tls(config)?;
            let auth = config.credentials().map(|(u, p)| (u.to_string(), p.to_string()));
            Arc::new(TunnelDialer::new(
                Http2Opener::new(remote, tls, opts, pool, auth)?,
                dial_timeout,
            ))
        }
        #[cfg(feature = "quic")]
        TransportKind::Quic => {
            let tls = require_tls(config)?;
            Arc::new(TunnelDialer::new(QuicOpener::new(remote, tls, pool)?, dial_timeout))
        }
        #[cfg(not(feature = "quic"))]
        TransportKind::Quic => anyhow::bail!("QUIC transport is not enabled in this build"),
    };

    Ok(dialer)
}

fn require_tls(config: &TunnelClientConfig) -> Result<&crate::config::TlsConfig> {
    config
        .tls
        .as_ref()
        .with_context(|| format!("Transport {} requires TLS configuration", config.transport))
}
