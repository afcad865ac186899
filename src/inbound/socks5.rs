//! SOCKS5 inbound handshake
//!
//! Subset of RFC 1928: the no-auth method and the CONNECT command only.
//!
//! ```text
//! greeting:  [VER=0x05][NMETHODS][METHODS...]      -> [0x05][0x00]
//! request:   [VER][CMD][RSV][ATYP][ADDR][PORT]     -> [0x05][REP][0x00][0x01][0;4][0;2]
//! ```

use crate::error::{ProtocolError, Socks5ReplyCode};
use crate::protocol::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;

/// TCP CONNECT command
pub const SOCKS5_CMD_CONNECT: u8 = 0x01;

const SOCKS5_RESERVED: u8 = 0x00;

/// Build a reply carrying the fixed, unused bound address `0.0.0.0:0`
pub fn reply(code: Socks5ReplyCode) -> [u8; 10] {
    [
        SOCKS5_VERSION,
        code.into(),
        SOCKS5_RESERVED,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Run the server side of the handshake and return the requested
/// destination. The success reply has been sent when this returns `Ok`.
///
/// Malformed input aborts without a reply; an unsupported command or
/// address type gets a generic failure reply first.
pub async fn handshake<S>(stream: &mut S) -> Result<Address, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;
    stream.flush().await?;

    // Request
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, cmd, _rsv, atyp] = head;
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    if cmd != SOCKS5_CMD_CONNECT {
        let err = ProtocolError::UnsupportedCommand(cmd);
        send_failure(stream, &err).await;
        return Err(err);
    }
    if !matches!(atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6) {
        let err = ProtocolError::UnsupportedAddressType(atyp);
        send_failure(stream, &err).await;
        return Err(err);
    }

    let dst = Address::read_with_type(atyp, stream).await?;

    stream.write_all(&reply(Socks5ReplyCode::Succeeded)).await?;
    stream.flush().await?;

    debug!("SOCKS5 CONNECT {}", dst);
    Ok(dst)
}

async fn send_failure<S>(stream: &mut S, err: &ProtocolError)
where
    S: AsyncWrite + Unpin,
{
    let code = Socks5ReplyCode::from(err);
    // The connection is dropped right after, so a failed write changes nothing
    if stream.write_all(&reply(code)).await.is_ok() {
        let _ = stream.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::duplex;

    async fn run(input: &[u8]) -> (Result<Address, ProtocolError>, Vec<u8>) {
        let (mut client, mut server) = duplex(1024);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let result = handshake(&mut server).await;
        drop(server);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let (result, written) = run(&[
            0x05, 0x01, 0x00, // greeting
            0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50,
        ])
        .await;

        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(result.unwrap(), Address::Ip(addr));
        assert_eq!(
            written,
            [0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_method_selection_precedes_request() {
        // The mock fails the test if a reply is written out of turn
        let mut stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x01, 0x00, 0x01, 0x0A, 0x00, 0x00, 0x02, 0x1F, 0x90])
            .write(&reply(Socks5ReplyCode::Succeeded))
            .build();

        let addr: SocketAddr = "10.0.0.2:8080".parse().unwrap();
        assert_eq!(handshake(&mut stream).await.unwrap(), Address::Ip(addr));
    }

    #[tokio::test]
    async fn test_connect_domain_ignores_offered_methods() {
        let mut input = vec![0x05, 0x02, 0x00, 0x02];
        input.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&443u16.to_be_bytes());

        let (result, written) = run(&input).await;
        assert_eq!(result.unwrap(), Address::Domain("example.com".into(), 443));
        assert_eq!(&written[..2], &[0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_udp_associate_gets_failure_reply() {
        let (result, written) = run(&[
            0x05, 0x01, 0x00, //
            0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0,
        ])
        .await;

        assert!(matches!(result, Err(ProtocolError::UnsupportedCommand(0x03))));
        assert_eq!(written[2..], reply(Socks5ReplyCode::GeneralFailure));
    }

    #[tokio::test]
    async fn test_unknown_address_type_gets_failure_reply() {
        let (result, written) = run(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x09]).await;
        assert!(matches!(
            result,
            Err(ProtocolError::UnsupportedAddressType(0x09))
        ));
        assert_eq!(written[2..], reply(Socks5ReplyCode::GeneralFailure));
    }

    #[tokio::test]
    async fn test_wrong_version_aborts_silently() {
        let (result, written) = run(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(4))));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_request_aborts_without_reply() {
        let (result, written) = run(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 127]).await;
        assert!(result.is_err());
        // Only the method selection was sent
        assert_eq!(written, [0x05, 0x00]);
    }
}
