//! Local inbound listeners
//!
//! An [`InboundServer`] accepts local client connections, runs the SOCKS5
//! or HTTP proxy handshake to learn the destination, asks the router which
//! outbound to use, dials it and relays.

pub mod http;
pub mod socks5;

use crate::config::{Config, InboundConfig};
use crate::error::TunnelError;
use crate::helper::Lifecycle;
use crate::protocol::Address;
use crate::relay::{is_connection_closed, relay, BufferPool};
use crate::router::{Dispatch, DIRECT, REJECT};
use crate::transport::{create_dialer, DirectDialer, RejectDialer, SocketOpts, StreamDialer};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Inbound protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// SOCKS5, CONNECT only
    Socks5,
    /// HTTP proxy, CONNECT and forward requests
    Http,
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundKind::Socks5 => f.write_str("socks5"),
            InboundKind::Http => f.write_str("http"),
        }
    }
}

/// Destination learned from a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Where the client wants to go
    pub dst: Address,
    /// Bytes that must reach the outbound stream before anything else
    pub early_data: Bytes,
}

/// Run the handshake for `kind` on a fresh client connection
pub async fn handshake(kind: InboundKind, stream: &mut TcpStream) -> Result<Handshake, TunnelError> {
    match kind {
        InboundKind::Socks5 => {
            let dst = socks5::handshake(stream).await?;
            Ok(Handshake {
                dst,
                early_data: Bytes::new(),
            })
        }
        InboundKind::Http => {
            let req = http::handshake(stream).await?;
            Ok(Handshake {
                dst: req.dst,
                early_data: req.early_data,
            })
        }
    }
}

/// Outbound dialers by tag, always including `direct` and `reject`
pub struct Outbounds {
    dialers: HashMap<String, Arc<dyn StreamDialer>>,
}

impl Outbounds {
    /// Only the built-in outbounds
    pub fn new(direct: DirectDialer) -> Self {
        let mut dialers: HashMap<String, Arc<dyn StreamDialer>> = HashMap::new();
        dialers.insert(DIRECT.to_string(), Arc::new(direct));
        dialers.insert(REJECT.to_string(), Arc::new(RejectDialer));
        Outbounds { dialers }
    }

    /// Built-in outbounds plus one dialer per configured tunnel client
    pub fn from_config(config: &Config) -> Result<Self> {
        let direct = DirectDialer::new(SocketOpts::default(), config.inbound.dial_timeout());
        let mut outbounds = Outbounds::new(direct);
        for client in &config.tunnel_clients {
            let dialer = create_dialer(client)
                .with_context(|| format!("Failed to create tunnel client '{}'", client.tag))?;
            info!(
                "Outbound '{}': {} tunnel to {}",
                client.tag, client.transport, client.address
            );
            outbounds.insert(client.tag.clone(), dialer);
        }
        Ok(outbounds)
    }

    /// Add or replace an outbound
    pub fn insert(&mut self, tag: impl Into<String>, dialer: Arc<dyn StreamDialer>) {
        self.dialers.insert(tag.into(), dialer);
    }

    /// Dialer for `tag`
    pub fn get(&self, tag: &str) -> Option<&Arc<dyn StreamDialer>> {
        self.dialers.get(tag)
    }

    /// Close every dialer and its pooled connections
    pub async fn close(&self) {
        for dialer in self.dialers.values() {
            dialer.close().await;
        }
    }
}

/// Shared state of every connection handler
#[derive(Clone)]
pub struct InboundContext {
    /// Picks the outbound tag for a destination
    pub dispatch: Dispatch,
    /// Available outbounds
    pub outbounds: Arc<Outbounds>,
    /// Relay buffers
    pub buffers: BufferPool,
    /// Handshake and dial deadlines
    pub config: InboundConfig,
}

/// SOCKS5 or HTTP proxy listener
pub struct InboundServer {
    kind: InboundKind,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    context: InboundContext,
    lifecycle: Lifecycle,
}

impl InboundServer {
    /// Bind the listener; nothing is accepted until [`InboundServer::serve`]
    pub async fn bind(kind: InboundKind, addr: &str, context: InboundContext) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {} inbound on {}", kind, addr))?;
        let local_addr = listener.local_addr()?;
        info!("{} inbound listening on {}", kind, local_addr);

        Ok(InboundServer {
            kind,
            local_addr,
            listener: Mutex::new(Some(listener)),
            context,
            lifecycle: Lifecycle::new(),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections being handled
    pub fn active_connections(&self) -> usize {
        self.lifecycle.active()
    }

    /// Accept connections until [`InboundServer::close`] or
    /// [`InboundServer::shutdown`]. The listener is released on return.
    pub async fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("Inbound server is already serving")?;

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.lifecycle.stopped() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("{} inbound accept error: {}", self.kind, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let kind = self.kind;
            let context = self.context.clone();
            self.lifecycle.spawn(async move {
                if let Err(e) = handle_connection(kind, stream, &context).await {
                    log_handler_error(kind, peer, &e);
                }
            });
        }

        info!("{} inbound on {} stopped", self.kind, self.local_addr);
        Ok(())
    }

    /// Stop accepting and drop every active connection
    pub fn close(&self) {
        self.lifecycle.close();
    }

    /// Stop accepting and wait for active connections to finish
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    /// Like `shutdown`, but active connections still running after `grace` are
    /// dropped. Returns whether everything finished in time.
    pub async fn shutdown_timeout(&self, grace: Duration) -> bool {
        self.lifecycle.shutdown_timeout(grace).await
    }
}

async fn handle_connection(
    kind: InboundKind,
    mut stream: TcpStream,
    context: &InboundContext,
) -> Result<(), TunnelError> {
    let _ = stream.set_nodelay(true);

    let handshake_timeout = context.config.handshake_timeout();
    let Handshake { dst, early_data } =
        tokio::time::timeout(handshake_timeout, handshake(kind, &mut stream))
            .await
            .map_err(|_| TunnelError::Timeout(format!("{} handshake", kind)))??;

    let tag = (context.dispatch)(&dst);
    let dialer = context
        .outbounds
        .get(&tag)
        .ok_or_else(|| TunnelError::Config(format!("unknown outbound '{}'", tag)))?;
    debug!("{} {} via {}", kind, dst, tag);

    let mut remote = tokio::time::timeout(context.config.dial_timeout(), dialer.dial(&dst))
        .await
        .map_err(|_| TunnelError::Timeout(format!("dial {} via {}", dst, tag)))??;

    if !early_data.is_empty() {
        remote.write_all(&early_data).await?;
        remote.flush().await?;
    }

    relay(stream, remote, &context.buffers).await?;
    Ok(())
}

fn log_handler_error(kind: InboundKind, peer: SocketAddr, err: &TunnelError) {
    match err {
        TunnelError::Io(e) if is_connection_closed(e) => {
            debug!("{} connection from {} closed: {}", kind, peer, e)
        }
        TunnelError::Protocol(_) | TunnelError::Timeout(_) | TunnelError::Rejected(_) => {
            debug!("{} connection from {}: {}", kind, peer, err)
        }
        _ => warn!("{} connection from {}: {}", kind, peer, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use tokio::io::AsyncReadExt;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn context(rules: &[&str]) -> InboundContext {
        let direct = DirectDialer::new(SocketOpts::default(), Duration::from_secs(1));
        InboundContext {
            dispatch: Router::new(rules).unwrap().into_dispatch(),
            outbounds: Arc::new(Outbounds::new(direct)),
            buffers: BufferPool::default(),
            config: InboundConfig::default(),
        }
    }

    async fn start(kind: InboundKind, rules: &[&str]) -> Arc<InboundServer> {
        let server = Arc::new(
            InboundServer::bind(kind, "127.0.0.1:0", context(rules))
                .await
                .unwrap(),
        );
        tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });
        server
    }

    #[tokio::test]
    async fn test_socks5_direct_relay() {
        let echo = echo_server().await;
        let server = start(InboundKind::Socks5, &[]).await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(replies[3], 0x00);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.close();
    }

    #[tokio::test]
    async fn test_http_forward_writes_request_first() {
        let echo = echo_server().await;
        let server = start(InboundKind::Http, &[]).await;

        let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", echo.port());
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();

        // The echo server returns exactly what the outbound stream received
        let mut buf = vec![0u8; request.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, request.as_bytes());

        server.close();
    }

    #[tokio::test]
    async fn test_rejected_destination_is_closed() {
        let server = start(InboundKind::Http, &["final,reject"]).await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        // The handshake already answered; the reject shows up as a close
        assert!(response.starts_with(b"HTTP/1.1 200"));

        server.close();
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes() {
        let mut ctx = context(&[]);
        ctx.config.handshake_timeout_secs = 1;
        let server = Arc::new(
            InboundServer::bind(InboundKind::Socks5, "127.0.0.1:0", ctx)
                .await
                .unwrap(),
        );
        tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&[0x05]).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        server.close();
    }

    #[tokio::test]
    async fn test_serve_twice_fails_and_shutdown_returns() {
        let server = start(InboundKind::Socks5, &[]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.serve().await.is_err());

        tokio::time::timeout(Duration::from_secs(1), server.shutdown())
            .await
            .unwrap();
        assert_eq!(server.active_connections(), 0);
    }
}
