//! Server side of the HTTP/2 based transports
//!
//! One task per TLS connection drives the HTTP/2 server and turns each
//! accepted request into a logical stream: a gRPC tunnel call, or an
//! authenticated CONNECT request.

use super::handler::{handle_stream, StreamContext};
use super::log_stream_error;
use crate::error::TunnelError;
use crate::helper::Lifecycle;
use crate::protocol::Digest;
use crate::transport::grpc::GrpcStream;
use crate::transport::h2::{H2Stream, CONN_WINDOW, STREAM_WINDOW};
use crate::transport::http2::check_basic_auth;
use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use http::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Which kind of requests an HTTP/2 tunnel server expects
#[derive(Debug, Clone)]
pub enum H2Mode {
    /// gRPC tunnel calls
    Grpc,
    /// CONNECT requests, optionally with required basic-auth credentials
    Connect {
        /// Digest of `user:password`
        auth: Option<Digest>,
    },
}

/// Drive one HTTP/2 server connection until the peer goes away, or until
/// shutdown has drained it
pub async fn serve_connection<T>(
    io: T,
    peer: SocketAddr,
    mode: H2Mode,
    ctx: Arc<StreamContext>,
    lifecycle: Lifecycle,
) -> Result<(), h2::Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = h2::server::Builder::new()
        .initial_window_size(STREAM_WINDOW)
        .initial_connection_window_size(CONN_WINDOW)
        .handshake::<_, Bytes>(io)
        .await?;

    let mut draining = false;
    loop {
        let next = tokio::select! {
            _ = lifecycle.stopped(), if !draining => None,
            next = conn.accept() => Some(next),
        };
        let (request, respond) = match next {
            None => {
                // Refuse new streams, finish the open ones
                conn.graceful_shutdown();
                draining = true;
                continue;
            }
            Some(None) => break,
            Some(Some(accepted)) => accepted?,
        };

        let stream = match &mode {
            H2Mode::Grpc => GrpcStream::accept(request, respond).map(StreamKind::Grpc),
            H2Mode::Connect { auth } => {
                accept_connect(request, respond, auth.as_ref()).map(StreamKind::Connect)
            }
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Refused HTTP/2 request from {}: {}", peer, e);
                continue;
            }
        };

        let ctx = ctx.clone();
        lifecycle.spawn(async move {
            let result = match stream {
                StreamKind::Grpc(stream) => handle_stream(stream, &ctx).await,
                StreamKind::Connect(stream) => handle_stream(stream, &ctx).await,
            };
            if let Err(e) = result {
                log_stream_error(peer, &e);
            }
        });
    }

    debug!("HTTP/2 connection from {} closed", peer);
    Ok(())
}

enum StreamKind {
    Grpc(GrpcStream),
    Connect(H2Stream),
}

/// Answer a CONNECT request: `200` opens the stream, anything else gets
/// `400` so the endpoint does not advertise itself as a proxy
fn accept_connect(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    auth: Option<&Digest>,
) -> Result<H2Stream, TunnelError> {
    if request.method() != Method::CONNECT {
        reply_status(&mut respond, StatusCode::BAD_REQUEST);
        return Err(TunnelError::Handshake(format!(
            "{} is not CONNECT",
            request.method()
        )));
    }
    if let Some(expected) = auth {
        let header = request.headers().get(http::header::PROXY_AUTHORIZATION);
        if !check_basic_auth(header, expected) {
            reply_status(&mut respond, StatusCode::BAD_REQUEST);
            return Err(TunnelError::Handshake("bad proxy credentials".into()));
        }
    }

    let response = Response::builder()
        .status(StatusCode::OK)
        .body(())
        .map_err(|e| TunnelError::Transport(e.to_string()))?;
    let send = respond
        .send_response(response, false)
        .map_err(|e| TunnelError::Transport(e.to_string()))?;
    Ok(H2Stream::new(send, request.into_body()))
}

fn reply_status(respond: &mut SendResponse<Bytes>, status: StatusCode) {
    if let Ok(response) = Response::builder().status(status).body(()) {
        let _ = respond.send_response(response, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{credential_digest, Address, TunnelHeader};
    use crate::relay::BufferPool;
    use crate::transport::http2::basic_auth;
    use crate::transport::SocketOpts;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn context() -> Arc<StreamContext> {
        Arc::new(StreamContext {
            fallback: None,
            handshake_timeout: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(1),
            socket_opts: SocketOpts::default(),
            buffers: BufferPool::default(),
        })
    }

    async fn client(mode: H2Mode) -> (h2::client::SendRequest<Bytes>, Lifecycle) {
        let (client_io, server_io) = duplex(64 * 1024);
        let lifecycle = Lifecycle::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let tracked = lifecycle.clone();
        lifecycle.spawn(async move {
            let _ = serve_connection(server_io, peer, mode, context(), tracked).await;
        });

        let (send, conn) = h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });
        (send, lifecycle)
    }

    fn connect_request(auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443");
        if let Some(auth) = auth {
            builder = builder.header(http::header::PROXY_AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_credentials() {
        let auth = Some(credential_digest("u", "p"));
        let (mut send, _lifecycle) = client(H2Mode::Connect { auth }).await;

        let (response, _) = send.send_request(connect_request(None), false).unwrap();
        assert_eq!(response.await.unwrap().status(), StatusCode::BAD_REQUEST);

        let wrong = basic_auth("u", "x");
        let (response, _) = send
            .send_request(connect_request(Some(&wrong)), false)
            .unwrap();
        assert_eq!(response.await.unwrap().status(), StatusCode::BAD_REQUEST);

        let right = basic_auth("u", "p");
        let (response, _) = send
            .send_request(connect_request(Some(&right)), false)
            .unwrap();
        assert_eq!(response.await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_connect_is_refused() {
        let (mut send, _lifecycle) = client(H2Mode::Connect { auth: None }).await;
        let request = Request::builder()
            .method(Method::GET)
            .uri("https://example.com/")
            .body(())
            .unwrap();
        let (response, _) = send.send_request(request, true).unwrap();
        assert_eq!(response.await.unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connect_stream_reaches_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = Address::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let (mut send, _lifecycle) = client(H2Mode::Connect { auth: None }).await;
        let (response, send_stream) = send.send_request(connect_request(None), false).unwrap();
        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut stream = H2Stream::new(send_stream, response.into_body());
        TunnelHeader::new(dst).write_to(&mut stream).await.unwrap();
        stream.write_all(b"over h2").await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over h2");
    }

    #[tokio::test]
    async fn test_shutdown_drains_idle_connection() {
        let (_send, lifecycle) = client(H2Mode::Grpc).await;
        // The server sends GOAWAY and finishes once the client acknowledges
        tokio::time::timeout(Duration::from_secs(2), lifecycle.shutdown())
            .await
            .unwrap();
        assert_eq!(lifecycle.active(), 0);
    }
}
