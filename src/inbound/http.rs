//! HTTP proxy inbound handshake
//!
//! `CONNECT host:port` is answered with `200 Connection established` and the
//! socket becomes a raw tunnel. Any other method is a forward-proxy request:
//! the destination comes from the absolute URI or the `Host` header, and
//! every byte read so far is handed back as early data so it reaches the
//! outbound stream before anything else.

use crate::error::ProtocolError;
use crate::protocol::Address;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Largest request head accepted
pub const MAX_HEAD_LEN: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Outcome of the HTTP proxy handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Destination to dial
    pub dst: Address,
    /// Whether this was a CONNECT request
    pub connect: bool,
    /// Bytes to write to the outbound stream before relaying
    pub early_data: Bytes,
}

/// Read one request head from `stream` and answer CONNECT requests
pub async fn handshake<S>(stream: &mut S) -> Result<HttpRequest, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ProtocolError::InvalidHttp(
                "connection closed before end of request head".into(),
            ));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_LEN {
                    return Err(ProtocolError::InvalidHttp("request head too large".into()));
                }
                continue;
            }
            Err(e) => return Err(ProtocolError::InvalidHttp(e.to_string())),
        };

        let method = req.method.unwrap_or_default();
        let target = req.path.unwrap_or_default();
        let proto = match req.version {
            Some(0) => "HTTP/1.0",
            _ => "HTTP/1.1",
        };

        if method.eq_ignore_ascii_case("CONNECT") {
            let dst = authority_to_address(target, 443)?;
            stream
                .write_all(format!("{} 200 Connection established\r\n\r\n", proto).as_bytes())
                .await?;
            stream.flush().await?;

            debug!("HTTP CONNECT {}", dst);
            // Anything pipelined after the head belongs to the tunnel
            let early_data = buf.split_off(head_len).freeze();
            return Ok(HttpRequest {
                dst,
                connect: true,
                early_data,
            });
        }

        let authority = match uri_authority(target) {
            Some(authority) => authority,
            None => host_header(req.headers)?,
        };
        let dst = authority_to_address(authority, 80)?;
        debug!("HTTP {} {}", method, dst);
        return Ok(HttpRequest {
            dst,
            connect: false,
            early_data: buf.freeze(),
        });
    }
}

/// Authority of an absolute-form target such as `http://host:port/path`
fn uri_authority(target: &str) -> Option<&str> {
    let (_, rest) = target.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    // Drop userinfo
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    (!authority.is_empty()).then_some(authority)
}

fn host_header<'a>(headers: &[httparse::Header<'a>]) -> Result<&'a str, ProtocolError> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProtocolError::InvalidHttp("missing Host header".into()))
}

/// Parse `host[:port]`, using `default_port` when the port is absent
fn authority_to_address(authority: &str, default_port: u16) -> Result<Address, ProtocolError> {
    let has_port = if let Some(rest) = authority.strip_prefix('[') {
        rest.contains("]:")
    } else {
        authority.matches(':').count() == 1
    };

    if has_port {
        Address::parse(authority)
    } else {
        Address::from_host_port(authority, default_port)
    }
}
