//! Per-stream tunnel handling
//!
//! Read the tunnel header under a deadline, dial the destination and relay.
//! Streams whose header does not parse are handed to the decoy, with the
//! bytes already consumed replayed first, so a stranger talks to an ordinary
//! web server.

use crate::error::TunnelError;
use crate::protocol::{Address, TunnelHeader};
use crate::relay::{relay, BufferPool};
use crate::transport::{connect_tcp, SocketOpts};
use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// Settings shared by every stream of one tunnel server
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Decoy that receives streams failing the header check
    pub fallback: Option<Address>,
    /// Deadline for the tunnel header
    pub handshake_timeout: Duration,
    /// Deadline for dialing the destination
    pub dial_timeout: Duration,
    /// Options for outgoing TCP connections
    pub socket_opts: SocketOpts,
    /// Relay buffers
    pub buffers: BufferPool,
}

/// Reader that keeps a copy of everything read through it
struct Recorder<'a, S> {
    inner: &'a mut S,
    seen: &'a mut BytesMut,
}

impl<S: AsyncRead + Unpin> AsyncRead for Recorder<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.seen.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Serve one logical stream until either side finishes
pub async fn handle_stream<S>(mut stream: S, ctx: &StreamContext) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut consumed = BytesMut::new();
    let header = {
        let mut recorder = Recorder {
            inner: &mut stream,
            seen: &mut consumed,
        };
        tokio::time::timeout(ctx.handshake_timeout, TunnelHeader::read_from(&mut recorder)).await
    };

    let header = match header {
        Ok(Ok(header)) => header,
        Ok(Err(e)) => return fallback(stream, &consumed, e.to_string(), ctx).await,
        Err(_) => return fallback(stream, &consumed, "header timeout".into(), ctx).await,
    };

    let remote = connect_tcp(&header.dst, &ctx.socket_opts, ctx.dial_timeout).await?;
    debug!("Tunnel stream connected to {}", header.dst);

    relay(stream, remote, &ctx.buffers).await?;
    Ok(())
}

async fn fallback<S>(
    stream: S,
    consumed: &[u8],
    reason: String,
    ctx: &StreamContext,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(decoy) = &ctx.fallback else {
        return Err(TunnelError::Handshake(reason));
    };
    debug!("Bad tunnel header ({}), forwarding to {}", reason, decoy);

    let mut remote = connect_tcp(decoy, &ctx.socket_opts, ctx.dial_timeout).await?;
    if !consumed.is_empty() {
        remote.write_all(consumed).await?;
    }
    relay(stream, remote, &ctx.buffers).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    fn context(fallback: Option<Address>) -> StreamContext {
        StreamContext {
            fallback,
            handshake_timeout: Duration::from_millis(300),
            dial_timeout: Duration::from_secs(1),
            socket_opts: SocketOpts::default(),
            buffers: BufferPool::default(),
        }
    }

    #[tokio::test]
    async fn test_recorder_keeps_consumed_bytes() {
        let mut input: &[u8] = b"\x00\x03\x01a\x00\x50rest";
        let mut seen = BytesMut::new();
        let mut recorder = Recorder {
            inner: &mut input,
            seen: &mut seen,
        };
        let header = TunnelHeader::read_from(&mut recorder).await.unwrap();
        assert_eq!(header.dst, Address::Domain("a".into(), 80));
        assert_eq!(&seen[..], b"\x00\x03\x01a\x00\x50");
        assert_eq!(input, b"rest");
    }

    #[tokio::test]
    async fn test_valid_header_relays_to_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = Address::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(async move { handle_stream(server, &context(None)).await });

        TunnelHeader::new(dst).write_to(&mut client).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_header_without_fallback_is_dropped() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let err = handle_stream(server, &context(None)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Handshake(_)));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (_client, server) = duplex(1024);
        let err = handle_stream(server, &context(None)).await.unwrap_err();
        assert!(err.to_string().contains("header timeout"));
    }

    #[tokio::test]
    async fn test_bad_header_goes_to_fallback_with_replay() {
        let decoy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let decoy_addr = Address::from(decoy.local_addr().unwrap());
        let received = tokio::spawn(async move {
            let (mut conn, _) = decoy.accept().await.unwrap();
            let mut buf = vec![0u8; 18];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await.unwrap();
            buf
        });

        let (mut client, server) = duplex(1024);
        let ctx = context(Some(decoy_addr));
        let task = tokio::spawn(async move { handle_stream(server, &ctx).await });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = vec![0u8; 26];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.1 404 Not Found\r\n\r\n");
        assert_eq!(received.await.unwrap(), b"GET / HTTP/1.1\r\n\r\n");

        drop(client);
        let _ = task.await.unwrap();
    }
}
