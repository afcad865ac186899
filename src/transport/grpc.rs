//! gRPC transport
//!
//! Each logical stream is one bidirectional `POST /tunnel.Tunnel/Stream`
//! call. Payload chunks travel as `Data` protobuf messages with the
//! standard 5-byte gRPC length prefix; the server ends a call with
//! `grpc-status: 0` trailers. Calls are multiplexed over a [`SlotPool`] of
//! mutual-TLS HTTP/2 connections.

use super::h2::{h2_to_io, poll_recv_chunk, poll_send_chunk, H2Connector};
use super::{BoxStream, SocketOpts, StreamOpener};
use crate::config::{PoolConfig, TlsConfig, TransportKind};
use crate::error::{PoolError, TunnelError};
use crate::pool::{PhysicalConn, SlotPool};
use crate::protocol::Address;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use prost::Message;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Method path of the tunnel call
pub const GRPC_PATH: &str = "/tunnel.Tunnel/Stream";

/// Content type of every gRPC request and response
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

const PREFIX_LEN: usize = 5;

/// Largest payload packed into one message
const MAX_CHUNK: usize = 16 * 1024;

/// Largest message accepted from the peer
const MAX_MESSAGE: usize = 4 * 1024 * 1024;

/// Protobuf messages of the tunnel service
pub mod proto {
    /// One chunk of stream payload
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Data {
        /// Raw bytes
        #[prost(bytes = "bytes", tag = "1")]
        pub data: bytes::Bytes,
    }
}

/// Length-prefix one `Data` message carrying `payload`
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let msg = proto::Data {
        data: Bytes::copy_from_slice(payload),
    };
    let len = msg.encoded_len();
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + len);
    buf.put_u8(0);
    buf.put_u32(len as u32);
    // Capacity was reserved above, encoding cannot run out of space
    let _ = msg.encode(&mut buf);
    buf.freeze()
}

/// Pop one complete message off `buf`, if there is one
pub fn decode_frame(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if buf.len() < PREFIX_LEN {
        return Ok(None);
    }
    if buf[0] != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "compressed gRPC messages are not supported",
        ));
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("gRPC message too large: {} bytes", len),
        ));
    }
    if buf.len() < PREFIX_LEN + len {
        return Ok(None);
    }

    buf.advance(PREFIX_LEN);
    let msg = buf.split_to(len).freeze();
    let data = proto::Data::decode(msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(data.data))
}

enum Side {
    Client,
    Server,
}

/// One gRPC call as a byte stream
pub struct GrpcStream {
    side: Side,
    send: SendStream<Bytes>,
    recv: RecvStream,
    inbox: BytesMut,
    payload: Bytes,
    /// Frame being written and the caller bytes it carries
    outgoing: Option<(Bytes, usize)>,
    shut: bool,
}

impl std::fmt::Debug for GrpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcStream")
            .field("inbox", &self.inbox.len())
            .field("payload", &self.payload.len())
            .field("shut", &self.shut)
            .finish()
    }
}

impl GrpcStream {
    fn new(side: Side, send: SendStream<Bytes>, recv: RecvStream) -> Self {
        GrpcStream {
            side,
            send,
            recv,
            inbox: BytesMut::new(),
            payload: Bytes::new(),
            outgoing: None,
            shut: false,
        }
    }

    /// Client half of a call
    pub fn client(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        GrpcStream::new(Side::Client, send, recv)
    }

    /// Accept an incoming call: check the method and answer with the
    /// response headers. Anything but the tunnel call is refused.
    pub fn accept(
        request: Request<RecvStream>,
        mut respond: SendResponse<Bytes>,
    ) -> Result<Self, TunnelError> {
        if request.uri().path() != GRPC_PATH {
            let path = request.uri().path().to_string();
            reject_call(&mut respond, 12);
            return Err(TunnelError::Handshake(format!("unknown gRPC method {}", path)));
        }

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE)
            .body(())
            .map_err(|e| TunnelError::Transport(e.to_string()))?;
        let send = respond
            .send_response(response, false)
            .map_err(|e| TunnelError::Transport(e.to_string()))?;
        Ok(GrpcStream::new(Side::Server, send, request.into_body()))
    }
}

fn status_trailers(code: u32) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from(code));
    trailers
}

/// Answer a call with a trailers-only error response
fn reject_call(respond: &mut SendResponse<Bytes>, code: u32) {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(status_trailers(code));
    }
    if let Ok(response) = builder.body(()) {
        let _ = respond.send_response(response, true);
    }
}

impl AsyncRead for GrpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.payload.is_empty() {
            if let Some(payload) = decode_frame(&mut this.inbox)? {
                this.payload = payload;
                continue;
            }
            match ready!(poll_recv_chunk(&mut this.recv, cx))? {
                Some(data) => this.inbox.extend_from_slice(&data),
                None if this.inbox.is_empty() => return Poll::Ready(Ok(())),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "gRPC call ended inside a message",
                    )))
                }
            }
        }

        let n = buf.remaining().min(this.payload.len());
        buf.put_slice(&this.payload[..n]);
        this.payload.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for GrpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = &mut *self;
        if this.outgoing.is_none() {
            let n = buf.len().min(MAX_CHUNK);
            this.outgoing = Some((encode_frame(&buf[..n]), n));
        }

        loop {
            let Some((frame, consumed)) = this.outgoing.as_mut() else {
                return Poll::Ready(Ok(0));
            };
            if frame.is_empty() {
                let consumed = *consumed;
                this.outgoing = None;
                return Poll::Ready(Ok(consumed));
            }
            if let Err(e) = ready!(poll_send_chunk(&mut this.send, cx, frame)) {
                this.outgoing = None;
                return Poll::Ready(Err(e));
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shut {
            return Poll::Ready(Ok(()));
        }
        self.shut = true;
        let result = match self.side {
            Side::Client => self.send.send_data(Bytes::new(), true),
            Side::Server => self.send.send_trailers(status_trailers(0)),
        };
        Poll::Ready(result.map_err(h2_to_io))
    }
}

/// Opens gRPC calls on pooled connections
pub struct GrpcOpener {
    pool: Arc<SlotPool<H2Connector>>,
    authority: String,
}

impl GrpcOpener {
    /// Create an opener; connections are dialed in the background
    pub fn new(
        remote: Address,
        tls: &TlsConfig,
        socket_opts: SocketOpts,
        pool: PoolConfig,
    ) -> anyhow::Result<Self> {
        let connector = H2Connector::new(remote.clone(), tls, socket_opts, &pool)?;
        Ok(GrpcOpener {
            pool: SlotPool::new(connector, pool),
            authority: remote.to_string(),
        })
    }

    /// Pool backing this opener
    pub fn pool(&self) -> &Arc<SlotPool<H2Connector>> {
        &self.pool
    }

    fn request(&self) -> Result<Request<()>, TunnelError> {
        Request::builder()
            .method("POST")
            .uri(format!("https://{}{}", self.authority, GRPC_PATH))
            .header(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE)
            .header(http::header::TE, "trailers")
            .body(())
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }
}

#[async_trait]
impl StreamOpener for GrpcOpener {
    async fn open(&self, _dst: &Address) -> Result<BoxStream, TunnelError> {
        let conn = self.pool.acquire().await?;
        let (response, send) = conn.send_request(self.request()?).await?;

        let response = response.await.map_err(|e| {
            if conn.is_ready() {
                TunnelError::Transport(format!("gRPC call: {}", e))
            } else {
                PoolError::Transient(e.to_string()).into()
            }
        })?;
        if response.status() != StatusCode::OK {
            return Err(TunnelError::Transport(format!(
                "gRPC call answered {}",
                response.status()
            )));
        }

        Ok(Box::new(GrpcStream::client(send, response.into_body())))
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Grpc
    }
}
