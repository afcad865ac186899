//! Mutual TLS configuration
//!
//! Builds rustls client and server configs from [`TlsConfig`] material. Both
//! sides present a certificate and verify the peer against the same CA.

use crate::config::TlsConfig;
use crate::protocol::Address;
use anyhow::{anyhow, Context, Result};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

/// ALPN for the HTTP/2 based transports (gRPC, HTTP/2 CONNECT)
pub const ALPN_H2: &[u8] = b"h2";

/// ALPN for the QUIC transport
pub const ALPN_QUIC: &[u8] = b"tunnelrat";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn read_pem(inline: &Option<String>, file: &Option<String>, what: &str) -> Result<Vec<u8>> {
    match (inline, file) {
        (Some(pem), _) => Ok(pem.as_bytes().to_vec()),
        (None, Some(path)) => std::fs::read(path)
            .with_context(|| format!("Failed to read {} file: {}", what, path)),
        (None, None) => Err(anyhow!("{} not configured", what)),
    }
}

fn load_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse {} PEM", what))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", what));
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .context("Failed to parse private key PEM")?
        .ok_or_else(|| anyhow!("No private key found"))
}

fn load_roots(tls: &TlsConfig) -> Result<RootCertStore> {
    let pem = read_pem(&tls.ca_pem, &tls.ca_file, "CA certificate")?;
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&pem, "CA certificate")? {
        roots
            .add(cert)
            .context("Failed to add CA certificate to store")?;
    }
    Ok(roots)
}

fn load_identity(tls: &TlsConfig) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = read_pem(&tls.cert_pem, &tls.cert_file, "certificate")?;
    let key = read_pem(&tls.key_pem, &tls.key_file, "private key")?;
    Ok((load_certs(&cert, "certificate")?, load_key(&key)?))
}

/// Client config that presents our certificate and trusts only the CA
pub fn client_config(tls: &TlsConfig, alpn: &[&[u8]]) -> Result<Arc<ClientConfig>> {
    let roots = load_roots(tls)?;
    let (certs, key) = load_identity(tls)?;

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("Failed to build TLS client config")?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Server config that requires a client certificate signed by the CA
pub fn server_config(tls: &TlsConfig, alpn: &[&[u8]]) -> Result<Arc<ServerConfig>> {
    let roots = load_roots(tls)?;
    let (certs, key) = load_identity(tls)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .context("Failed to build client certificate verifier")?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Name to verify the server certificate against
pub fn server_name(tls: &TlsConfig, remote: &Address) -> Result<ServerName<'static>> {
    let host = match &tls.server_name {
        Some(name) => name.clone(),
        None => remote.host(),
    };
    ServerName::try_from(host.clone()).with_context(|| format!("Invalid server name: {}", host))
}
