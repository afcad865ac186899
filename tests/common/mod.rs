//! Test utilities for Tunnelrat
//!
//! This module provides common test utilities used across integration tests:
//! throwaway certificates, echo targets and tunnel configurations.

#![allow(dead_code)]

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tunnelrat::config::{
    HealthCheckConfig, PoolConfig, TcpConfig, TlsConfig, TransportKind, TunnelClientConfig, TunnelServerConfig,
};
use tunnelrat::relay::BufferPool;
use tunnelrat::tunnel::TunnelServer;

/// PEM material for one mutual-TLS deployment
pub struct TestPki {
    pub ca_pem: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

impl TestPki {
    /// CA plus a server and a client leaf, both valid for `localhost` and
    /// `127.0.0.1`
    pub fn generate() -> Self {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tunnelrat test CA");
        let ca_key = KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf = |name: &str| {
            let mut params =
                CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                    .unwrap();
            params.distinguished_name.push(DnType::CommonName, name);
            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &ca, &ca_key).unwrap();
            (cert.pem(), key.serialize_pem())
        };
        let (server_cert, server_key) = leaf("tunnelrat server");
        let (client_cert, client_key) = leaf("tunnelrat client");

        TestPki {
            ca_pem: ca.pem(),
            server_cert,
            server_key,
            client_cert,
            client_key,
        }
    }

    /// TLS settings for the tunnel server
    pub fn server_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_pem: Some(self.server_cert.clone()),
            key_pem: Some(self.server_key.clone()),
            ca_pem: Some(self.ca_pem.clone()),
            ..Default::default()
        }
    }

    /// TLS settings for the tunnel client
    pub fn client_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_pem: Some(self.client_cert.clone()),
            key_pem: Some(self.client_key.clone()),
            ca_pem: Some(self.ca_pem.clone()),
            ..Default::default()
        }
    }
}

/// Echo server that answers every connection until the test ends
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Decoy web server that reads one request head and answers with a fixed page
pub async fn start_decoy_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = conn.write_all(DECOY_RESPONSE).await;
                let _ = conn.shutdown().await;
            });
        }
    });
    addr
}

/// Response sent by [`start_decoy_server`]
pub const DECOY_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot found";

/// Tunnel server configuration on an ephemeral port
pub fn server_config(transport: TransportKind, pki: Option<&TestPki>) -> TunnelServerConfig {
    let mut config = TunnelServerConfig::new("127.0.0.1:0", transport);
    config.tls = pki.map(TestPki::server_tls);
    config.handshake_timeout_secs = 2;
    config
}

/// Tunnel client configuration pointing at `addr`
pub fn client_config(
    transport: TransportKind,
    addr: SocketAddr,
    pki: Option<&TestPki>,
) -> TunnelClientConfig {
    TunnelClientConfig {
        tag: "proxy".to_string(),
        address: addr.to_string(),
        addresses: Vec::new(),
        health_check: HealthCheckConfig::default(),
        transport,
        tls: pki.map(TestPki::client_tls),
        tcp: TcpConfig::default(),
        pool_size: Some(1),
        pool: PoolConfig::default(),
        username: None,
        password: None,
        dial_timeout_secs: 5,
    }
}

/// Bind and serve a tunnel server in the background
pub async fn start_tunnel_server(config: &TunnelServerConfig) -> Arc<TunnelServer> {
    let server = Arc::new(
        TunnelServer::bind(config, BufferPool::default())
            .await
            .unwrap(),
    );
    tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });
    server
}
