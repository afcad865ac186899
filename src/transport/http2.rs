//! HTTP/2 CONNECT transport
//!
//! Every logical stream is a CONNECT request whose authority is the
//! destination, optionally carrying `Proxy-Authorization: Basic`. Clients
//! come from a [`RefCountPool`] so a handful of HTTP/2 connections carry
//! all traffic.

use super::h2::{H2Conn, H2Connector, H2Stream};
use super::{BoxStream, SocketOpts, StreamOpener};
use crate::config::{PoolConfig, TlsConfig, TransportKind};
use crate::error::{PoolError, TunnelError};
use crate::pool::{Lease, PhysicalConn, RefCountPool};
use crate::protocol::{credential_digest, digest, Address, Digest};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{HeaderValue, Method, Request, StatusCode};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const BASIC_PREFIX: &str = "Basic ";

/// `Proxy-Authorization` value for the given credentials
pub fn basic_auth(username: &str, password: &str) -> String {
    format!(
        "{}{}",
        BASIC_PREFIX,
        STANDARD.encode(format!("{}:{}", username, password))
    )
}

/// Whether a `Proxy-Authorization` header matches `expected`, the
/// [`credential_digest`] of the configured user and password
pub fn check_basic_auth(header: Option<&HeaderValue>, expected: &Digest) -> bool {
    let Some(value) = header.and_then(|h| h.to_str().ok()) else {
        return false;
    };
    if value.len() <= BASIC_PREFIX.len()
        || !value[..BASIC_PREFIX.len()].eq_ignore_ascii_case(BASIC_PREFIX)
    {
        return false;
    }
    match STANDARD.decode(value[BASIC_PREFIX.len()..].trim()) {
        Ok(decoded) => digest(&decoded) == *expected,
        Err(_) => false,
    }
}

/// CONNECT stream; keeps its client leased until dropped
pub struct Http2Stream {
    inner: H2Stream,
    _lease: Lease<H2Conn>,
}

impl std::fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Stream")
            .field("inner", &self.inner)
            .field("lease", &self._lease)
            .finish()
    }
}

impl AsyncRead for Http2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Http2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Opens CONNECT streams on reference-counted HTTP/2 clients
pub struct Http2Opener {
    pool: Arc<RefCountPool<H2Connector>>,
    authorization: Option<HeaderValue>,
}

impl Http2Opener {
    /// Create an opener; `auth` is sent as basic proxy authorization
    pub fn new(
        remote: Address,
        tls: &TlsConfig,
        socket_opts: SocketOpts,
        pool: PoolConfig,
        auth: Option<(String, String)>,
    ) -> anyhow::Result<Self> {
        let connector = H2Connector::new(remote, tls, socket_opts, &pool)?;
        let authorization = match auth {
            Some((user, pass)) => Some(HeaderValue::from_str(&basic_auth(&user, &pass))?),
            None => None,
        };
        Ok(Http2Opener {
            pool: RefCountPool::new(connector, pool),
            authorization,
        })
    }

    /// Pool backing this opener
    pub fn pool(&self) -> &Arc<RefCountPool<H2Connector>> {
        &self.pool
    }

    fn request(&self, dst: &Address) -> Result<Request<()>, TunnelError> {
        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri(dst.to_string())
            .header(http::header::USER_AGENT, "Chrome/115.0.0.0");
        if let Some(auth) = &self.authorization {
            builder = builder.header(http::header::PROXY_AUTHORIZATION, auth.clone());
        }
        builder
            .body(())
            .map_err(|e| TunnelError::Transport(format!("CONNECT {}: {}", dst, e)))
    }
}

#[async_trait]
impl StreamOpener for Http2Opener {
    async fn open(&self, dst: &Address) -> Result<BoxStream, TunnelError> {
        let request = self.request(dst)?;
        let lease = self.pool.acquire().await?;
        let (response, send) = lease.send_request(request).await?;

        let response = response.await.map_err(|e| {
            if lease.is_ready() {
                TunnelError::Transport(format!("CONNECT {}: {}", dst, e))
            } else {
                PoolError::Transient(e.to_string()).into()
            }
        })?;
        if response.status() != StatusCode::OK {
            return Err(TunnelError::Handshake(format!(
                "CONNECT {} answered {}",
                dst,
                response.status()
            )));
        }

        Ok(Box::new(Http2Stream {
            inner: H2Stream::new(send, response.into_body()),
            _lease: lease,
        }))
    }

    async fn close(&self) {
        self.pool.close();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http2
    }
}

/// Digest of configured server credentials, if any
pub fn expected_auth(credentials: Option<(&str, &str)>) -> Option<Digest> {
    credentials.map(|(user, pass)| credential_digest(user, pass))
}
