//! Remote tunnel endpoint
//!
//! A [`TunnelServer`] terminates one transport, turns every incoming
//! logical stream (or, for `tcp` and `tls`, every accepted connection) into
//! a proxied session and, when configured, hands anything that fails the
//! tunnel header check to a decoy web server.

mod h2;
mod handler;
#[cfg(feature = "quic")]
mod quic;

pub use self::h2::H2Mode;
pub use handler::{handle_stream, StreamContext};

use crate::config::{TransportKind, TunnelServerConfig};
use crate::error::TunnelError;
use crate::helper::Lifecycle;
use crate::protocol::Address;
use crate::relay::{is_connection_closed, BufferPool};
use crate::tls::ALPN_H2;
use crate::transport::http2::expected_auth;
use crate::transport::SocketOpts;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Deadline for the TLS handshake on accepted connections
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum Listener {
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
    H2(TcpListener, TlsAcceptor, H2Mode),
    #[cfg(feature = "quic")]
    Quic(quinn::Endpoint),
}

/// Tunnel listener for one transport
pub struct TunnelServer {
    transport: TransportKind,
    local_addr: SocketAddr,
    listener: Mutex<Option<Listener>>,
    context: Arc<StreamContext>,
    lifecycle: Lifecycle,
}

impl TunnelServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: &TunnelServerConfig, buffers: BufferPool) -> Result<Self> {
        let fallback = config
            .fallback
            .as_deref()
            .map(Address::parse)
            .transpose()
            .context("Invalid fallback address")?;
        let context = Arc::new(StreamContext {
            fallback,
            handshake_timeout: config.handshake_timeout(),
            dial_timeout: config.dial_timeout(),
            socket_opts: SocketOpts::from_tcp_config(&config.tcp),
            buffers,
        });

        let listener = match config.transport {
            TransportKind::Tcp => Listener::Tcp(bind_tcp(&config.listen).await?),
            TransportKind::Tls => {
                let acceptor = acceptor(config, &[])?;
                Listener::Tls(bind_tcp(&config.listen).await?, acceptor)
            }
            TransportKind::Grpc => {
                let acceptor = acceptor(config, &[ALPN_H2])?;
                Listener::H2(bind_tcp(&config.listen).await?, acceptor, H2Mode::Grpc)
            }
            TransportKind::Http2 => {
                let acceptor = acceptor(config, &[ALPN_H2])?;
                let mode = H2Mode::Connect {
                    auth: expected_auth(config.credentials()),
                };
                Listener::H2(bind_tcp(&config.listen).await?, acceptor, mode)
            }
            #[cfg(feature = "quic")]
            TransportKind::Quic => {
                let tls = require_tls(config)?;
                let keepalive = Duration::from_secs(config.keepalive_interval);
                let server_config = crate::transport::quic::server_config(tls, keepalive)?;
                let addr = tokio::net::lookup_host(config.listen.as_str())
                    .await?
                    .next()
                    .with_context(|| format!("Failed to resolve {}", config.listen))?;
                let endpoint = quinn::Endpoint::server(server_config, addr)
                    .with_context(|| format!("Failed to bind QUIC on {}", config.listen))?;
                Listener::Quic(endpoint)
            }
            #[cfg(not(feature = "quic"))]
            TransportKind::Quic => anyhow::bail!("QUIC transport is not enabled in this build"),
        };

        let local_addr = match &listener {
            Listener::Tcp(l) | Listener::Tls(l, _) | Listener::H2(l, _, _) => l.local_addr()?,
            #[cfg(feature = "quic")]
            Listener::Quic(endpoint) => endpoint.local_addr()?,
        };
        info!(
            "Tunnel server ({}) listening on {}",
            config.transport, local_addr
        );
        if let Some(fallback) = &context.fallback {
            info!("Bad tunnel headers are forwarded to {}", fallback);
        }

        Ok(TunnelServer {
            transport: config.transport,
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

    /// Transport served
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Number of running connection and stream tasks
    pub fn active_tasks(&self) -> usize {
        self.lifecycle.active()
    }

    /// Accept until [`TunnelServer::close`] or [`TunnelServer::shutdown`].
    /// The listener is released on return.
    pub async fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("Tunnel server is already serving")?;

        match listener {
            Listener::Tcp(listener) => {
                while let Some((stream, peer)) = self.accept(&listener).await {
                    let ctx = self.context.clone();
                    self.lifecycle.spawn(async move {
                        if let Err(e) = handle_stream(stream, &ctx).await {
                            log_stream_error(peer, &e);
                        }
                    });
                }
            }
            Listener::Tls(listener, acceptor) => {
                while let Some((stream, peer)) = self.accept(&listener).await {
                    let ctx = self.context.clone();
                    let acceptor = acceptor.clone();
                    self.lifecycle.spawn(async move {
                        let result = match tls_accept(&acceptor, stream, peer).await {
                            Ok(stream) => handle_stream(stream, &ctx).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = result {
                            log_stream_error(peer, &e);
                        }
                    });
                }
            }
            Listener::H2(listener, acceptor, mode) => {
                while let Some((stream, peer)) = self.accept(&listener).await {
                    let ctx = self.context.clone();
                    let acceptor = acceptor.clone();
                    let mode = mode.clone();
                    let lifecycle = self.lifecycle.clone();
                    self.lifecycle.spawn(async move {
                        let stream = match tls_accept(&acceptor, stream, peer).await {
                            Ok(stream) => stream,
                            Err(e) => return log_stream_error(peer, &e),
                        };
                        if let Err(e) = h2::serve_connection(stream, peer, mode, ctx, lifecycle).await
                        {
                            debug!("HTTP/2 connection from {}: {}", peer, e);
                        }
                    });
                }
            }
            #[cfg(feature = "quic")]
            Listener::Quic(endpoint) => loop {
                let incoming = tokio::select! {
                    _ = self.lifecycle.stopped() => break,
                    incoming = endpoint.accept() => match incoming {
                        Some(incoming) => incoming,
                        None => break,
                    },
                };
                let ctx = self.context.clone();
                let lifecycle = self.lifecycle.clone();
                self.lifecycle.spawn(async move {
                    if let Err(e) = quic::serve_connection(incoming, ctx, lifecycle).await {
                        debug!("{}", e);
                    }
                });
            },
        }

        info!(
            "Tunnel server ({}) on {} stopped",
            self.transport, self.local_addr
        );
        Ok(())
    }

    async fn accept(&self, listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
        loop {
            tokio::select! {
                _ = self.lifecycle.stopped() => return None,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = self.context.socket_opts.apply(&stream) {
                            debug!("Failed to set socket options for {}: {}", peer, e);
                        }
                        return Some((stream, peer));
                    }
                    Err(e) => {
                        warn!("Tunnel accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    /// Stop accepting and drop every active stream
    pub fn close(&self) {
        self.lifecycle.close();
    }

    /// Stop accepting and wait for active streams to finish. HTTP/2
    /// connections are told to go away once their open streams are done.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }

    /// Like `shutdown`, but active streams still running after `grace` are
    /// dropped. Returns whether everything finished in time.
    pub async fn shutdown_timeout(&self, grace: Duration) -> bool {
        self.lifecycle.shutdown_timeout(grace).await
    }
}

async fn bind_tcp(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind tunnel listener on {}", addr))
}

fn require_tls(config: &TunnelServerConfig) -> Result<&crate::config::TlsConfig> {
    config
        .tls
        .as_ref()
        .with_context(|| format!("Transport {} requires TLS configuration", config.transport))
}

fn acceptor(config: &TunnelServerConfig, alpn: &[&[u8]]) -> Result<TlsAcceptor> {
    let tls = require_tls(config)?;
    Ok(TlsAcceptor::from(crate::tls::server_config(tls, alpn)?))
}

async fn tls_accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>, TunnelError> {
    tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| TunnelError::Timeout(format!("TLS handshake with {}", peer)))?
        .map_err(|e| TunnelError::Handshake(format!("TLS handshake with {}: {}", peer, e)))
}

/// Expected session ends and foreign traffic are debug noise; the rest is a warning
fn log_stream_error(peer: SocketAddr, err: &TunnelError) {
    match err {
        TunnelError::Io(e) if is_connection_closed(e) => {
            debug!("Tunnel stream from {} closed: {}", peer, e)
        }
        TunnelError::Protocol(_) | TunnelError::Handshake(_) | TunnelError::Timeout(_) => {
            debug!("Tunnel stream from {}: {}", peer, err)
        }
        _ => warn!("Tunnel stream from {}: {}", peer, err),
    }
}
