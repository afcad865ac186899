//! A client that does not speak the tunnel protocol must get exactly what
//! the decoy web server would have sent it

mod common;

use common::*;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tunnelrat::config::TransportKind;
use tunnelrat::Address;

const FOREIGN: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) -> Vec<u8> {
    stream.write_all(FOREIGN).await.unwrap();
    stream.flush().await.unwrap();
    let mut response = vec![0u8; DECOY_RESPONSE.len()];
    stream.read_exact(&mut response).await.unwrap();
    response
}

async fn exchange_tcp(addr: SocketAddr) -> Vec<u8> {
    exchange(TcpStream::connect(addr).await.unwrap()).await
}

#[tokio::test]
async fn test_tcp_stranger_sees_decoy() {
    let decoy = start_decoy_server().await;
    let direct = exchange_tcp(decoy).await;

    let mut config = server_config(TransportKind::Tcp, None);
    config.fallback = Some(decoy.to_string());
    let server = start_tunnel_server(&config).await;
    let through_tunnel = tokio::time::timeout(Duration::from_secs(5), exchange_tcp(server.local_addr()))
        .await
        .unwrap();

    assert_eq!(through_tunnel, direct);
    assert_eq!(through_tunnel, DECOY_RESPONSE);
    server.close();
}

#[tokio::test]
async fn test_random_bytes_see_decoy() {
    let decoy = start_decoy_server().await;
    let mut config = server_config(TransportKind::Tcp, None);
    config.fallback = Some(decoy.to_string());
    let server = start_tunnel_server(&config).await;

    let mut garbage: Vec<u8> = (0..256).map(|_| rand::random::<u8>()).collect();
    // A leading zero could pass as a header version
    garbage[0] |= 0x80;
    // Lets the decoy find the end of a "request"
    garbage.extend_from_slice(b"\r\n\r\n");

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(&garbage).await.unwrap();
    let mut response = vec![0u8; DECOY_RESPONSE.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, DECOY_RESPONSE);
    server.close();
}

#[tokio::test]
async fn test_tls_stranger_sees_decoy() {
    let pki = TestPki::generate();
    let decoy = start_decoy_server().await;

    let mut config = server_config(TransportKind::Tls, Some(&pki));
    config.fallback = Some(decoy.to_string());
    let server = start_tunnel_server(&config).await;

    let connector = TlsConnector::from(tunnelrat::tls::client_config(&pki.client_tls(), &[]).unwrap());
    let tcp = TcpStream::connect(server.local_addr()).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let tls = connector.connect(name, tcp).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), exchange(tls))
        .await
        .unwrap();
    assert_eq!(response, DECOY_RESPONSE);
    server.close();
}

#[tokio::test]
async fn test_stranger_without_fallback_is_closed() {
    let server = start_tunnel_server(&server_config(TransportKind::Tcp, None)).await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(FOREIGN).await.unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .unwrap();
    // Either a clean EOF or a reset, but never a reply
    if read.is_ok() {
        assert!(rest.is_empty());
    }
    server.close();
}

#[tokio::test]
async fn test_tunnel_traffic_unaffected_by_fallback() {
    let decoy = start_decoy_server().await;
    let echo = Address::from(start_echo_server().await);

    let mut config = server_config(TransportKind::Tcp, None);
    config.fallback = Some(decoy.to_string());
    let server = start_tunnel_server(&config).await;

    let dialer = tunnelrat::create_dialer(&client_config(
        TransportKind::Tcp,
        server.local_addr(),
        None,
    ))
    .unwrap();
    let mut stream = dialer.dial(&echo).await.unwrap();
    stream.write_all(b"not for the decoy").await.unwrap();
    let mut buf = [0u8; 17];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"not for the decoy");
    server.close();
}
