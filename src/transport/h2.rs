//! HTTP/2 plumbing shared by the gRPC and HTTP/2 CONNECT transports
//!
//! - [`H2Stream`]: one HTTP/2 request/response pair as `AsyncRead + AsyncWrite`
//! - [`H2Conn`]: a pooled client connection whose driver task answers the
//!   connection-level protocol and sends keep-alive pings
//! - [`H2Connector`]: dials mutual-TLS connections with ALPN `h2`

use super::{connect_tcp, SocketOpts};
use crate::config::{PoolConfig, TlsConfig};
use crate::error::{PoolError, TunnelError};
use crate::pool::{ConnState, Connector, PhysicalConn};
use crate::protocol::Address;
use anyhow::Context as _;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h2::client::{ResponseFuture, SendRequest};
use h2::{RecvStream, SendStream};
use http::Request;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stream-level flow control window
pub(crate) const STREAM_WINDOW: u32 = 1024 * 1024;

/// Connection-level flow control window
pub(crate) const CONN_WINDOW: u32 = 4 * 1024 * 1024;

/// Map an h2 error onto the I/O error kinds the relay understands
pub(crate) fn h2_to_io(err: h2::Error) -> io::Error {
    if err.is_io() {
        return err
            .into_io()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "h2 I/O error"));
    }
    if err.is_reset() || err.is_go_away() {
        return io::Error::new(io::ErrorKind::ConnectionReset, err);
    }
    io::Error::new(io::ErrorKind::Other, err)
}

/// Hand as much of `data` to `send` as flow control allows.
///
/// Returns the number of bytes queued, which is never zero.
pub(crate) fn poll_send_chunk(
    send: &mut SendStream<Bytes>,
    cx: &mut Context<'_>,
    data: &mut Bytes,
) -> Poll<io::Result<usize>> {
    send.reserve_capacity(data.len());
    loop {
        match ready!(send.poll_capacity(cx)) {
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream closed",
                )))
            }
            Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
            Some(Ok(0)) => continue,
            Some(Ok(capacity)) => {
                let n = capacity.min(data.len());
                let chunk = data.split_to(n);
                send.send_data(chunk, false).map_err(h2_to_io)?;
                return Poll::Ready(Ok(n));
            }
        }
    }
}

/// Poll the next DATA frame, returning flow-control credit immediately
pub(crate) fn poll_recv_chunk(
    recv: &mut RecvStream,
    cx: &mut Context<'_>,
) -> Poll<io::Result<Option<Bytes>>> {
    match ready!(recv.poll_data(cx)) {
        Some(Ok(data)) => {
            let _ = recv.flow_control().release_capacity(data.len());
            Poll::Ready(Ok(Some(data)))
        }
        Some(Err(e)) => Poll::Ready(Err(h2_to_io(e))),
        None => Poll::Ready(Ok(None)),
    }
}

/// Raw byte stream over one HTTP/2 request/response pair
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    buffered: Bytes,
    shut: bool,
}

impl H2Stream {
    /// Join the two halves of an HTTP/2 stream
    pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        H2Stream {
            send,
            recv,
            buffered: Bytes::new(),
            shut: false,
        }
    }
}

impl std::fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Stream")
            .field("buffered", &self.buffered.len())
            .field("shut", &self.shut)
            .finish()
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.buffered.is_empty() {
            match ready!(poll_recv_chunk(&mut this.recv, cx))? {
                Some(data) => this.buffered = data,
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.buffered.len());
        buf.put_slice(&this.buffered[..n]);
        this.buffered.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut data = Bytes::copy_from_slice(buf);
        poll_send_chunk(&mut self.send, cx, &mut data)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // DATA frames are flushed by the connection driver
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.shut {
            self.shut = true;
            self.send.send_data(Bytes::new(), true).map_err(h2_to_io)?;
        }
        Poll::Ready(Ok(()))
    }
}

const STATE_READY: u8 = 0;
const STATE_SHUTDOWN: u8 = 1;
const STATE_DEAD: u8 = 2;

/// Pooled HTTP/2 client connection
#[derive(Clone)]
pub struct H2Conn {
    send: SendRequest<Bytes>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for H2Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Conn").field("state", &self.state()).finish()
    }
}

impl H2Conn {
    /// Run the HTTP/2 client handshake over `io` and spawn the driver task.
    ///
    /// A non-zero `keepalive` sends a PING every interval; a failed or
    /// unanswered ping marks the connection dead.
    pub async fn handshake<T>(io: T, keepalive: Duration) -> Result<Self, h2::Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send, mut connection) = h2::client::Builder::new()
            .initial_window_size(STREAM_WINDOW)
            .initial_connection_window_size(CONN_WINDOW)
            .handshake::<_, Bytes>(io)
            .await?;

        let state = Arc::new(AtomicU8::new(STATE_READY));
        let cancel = CancellationToken::new();
        let ping_pong = connection.ping_pong();

        let driver_state = state.clone();
        let driver_cancel = cancel.clone();
        tokio::spawn(async move {
            let keepalive_task = async move {
                match ping_pong {
                    Some(mut ping_pong) if !keepalive.is_zero() => {
                        let mut ticker = tokio::time::interval(keepalive);
                        ticker.tick().await;
                        loop {
                            ticker.tick().await;
                            match tokio::time::timeout(keepalive, ping_pong.ping(h2::Ping::opaque()))
                                .await
                            {
                                Ok(Ok(_)) => {}
                                Ok(Err(e)) => {
                                    debug!("HTTP/2 ping failed: {}", e);
                                    return;
                                }
                                Err(_) => {
                                    warn!("HTTP/2 ping unanswered after {:?}", keepalive);
                                    return;
                                }
                            }
                        }
                    }
                    _ => std::future::pending::<()>().await,
                }
            };

            let next = tokio::select! {
                result = connection => match result {
                    Ok(()) => STATE_SHUTDOWN,
                    Err(e) => {
                        debug!("HTTP/2 connection error: {}", e);
                        STATE_DEAD
                    }
                },
                _ = keepalive_task => STATE_DEAD,
                _ = driver_cancel.cancelled() => STATE_SHUTDOWN,
            };
            driver_state.store(next, Ordering::Release);
        });

        Ok(H2Conn {
            send,
            state,
            cancel,
        })
    }

    /// Start a request; the body is streamed through the returned
    /// [`SendStream`]. A connection that refuses new streams is marked dead.
    pub async fn send_request(
        &self,
        request: Request<()>,
    ) -> Result<(ResponseFuture, SendStream<Bytes>), TunnelError> {
        if !self.is_ready() {
            return Err(PoolError::Transient(format!("HTTP/2 connection {:?}", self.state())).into());
        }
        let mut send = match self.send.clone().ready().await {
            Ok(send) => send,
            Err(e) => {
                self.mark_dead();
                return Err(PoolError::Transient(e.to_string()).into());
            }
        };
        send.send_request(request, false).map_err(|e| {
            self.mark_dead();
            TunnelError::from(PoolError::Transient(e.to_string()))
        })
    }

    fn mark_dead(&self) {
        let _ = self.state.compare_exchange(
            STATE_READY,
            STATE_DEAD,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl PhysicalConn for H2Conn {
    fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            STATE_READY => ConnState::Ready,
            STATE_SHUTDOWN => ConnState::Shutdown,
            _ => ConnState::Dead,
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Dials mutual-TLS HTTP/2 connections for a pool
pub struct H2Connector {
    remote: Address,
    tls: TlsConnector,
    server_name: ServerName<'static>,
    socket_opts: SocketOpts,
    connect_timeout: Duration,
    keepalive: Duration,
}

impl H2Connector {
    /// Create a connector for the tunnel server at `remote`
    pub fn new(
        remote: Address,
        tls: &TlsConfig,
        socket_opts: SocketOpts,
        pool: &PoolConfig,
    ) -> anyhow::Result<Self> {
        let client = crate::tls::client_config(tls, &[crate::tls::ALPN_H2])?;
        let server_name = crate::tls::server_name(tls, &remote)?;
        Ok(H2Connector {
            remote,
            tls: TlsConnector::from(client),
            server_name,
            socket_opts,
            connect_timeout: pool.connect_timeout(),
            keepalive: pool.keepalive_interval(),
        })
    }
}

#[async_trait]
impl Connector for H2Connector {
    type Conn = H2Conn;

    async fn connect(&self) -> anyhow::Result<H2Conn> {
        let tcp = connect_tcp(&self.remote, &self.socket_opts, self.connect_timeout).await?;
        let tls = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .with_context(|| format!("TLS handshake with {} failed", self.remote))?;
        let conn = H2Conn::handshake(tls, self.keepalive)
            .await
            .with_context(|| format!("HTTP/2 handshake with {} failed", self.remote))?;
        debug!("HTTP/2 connection established to {}", self.remote);
        Ok(conn)
    }

    fn remote(&self) -> String {
        self.remote.to_string()
    }
}
