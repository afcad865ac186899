//! Tunnel endpoint configuration
//!
//! A tunnel client is a named outbound that the router can pick; a tunnel
//! server terminates the transport on the remote side.

use super::pool::PoolConfig;
use super::transport::{TcpConfig, TlsConfig, TransportKind};
use crate::helper::{DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_HANDSHAKE_TIMEOUT_SECS};
use crate::protocol::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default handshake timeout
fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

/// Default dial timeout
fn default_dial_timeout() -> u64 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

/// Outbound tunnel to a remote tunnel server
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TunnelClientConfig {
    /// Outbound tag referenced by routing rules
    pub tag: String,

    /// Tunnel server address (`host:port`)
    pub address: String,

    /// More tunnel servers with the same settings. With any listed, the
    /// outbound is a group that routes through the fastest healthy server.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Round-trip checks for groups
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Transport kind
    #[serde(default)]
    pub transport: TransportKind,

    /// TLS material, required for every transport except `tcp`
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// TCP socket options
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Shorthand for `pool.size`
    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Pool tuning
    #[serde(default)]
    pub pool: PoolConfig,

    /// Basic-auth user (HTTP/2 only)
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password (HTTP/2 only)
    #[serde(default)]
    pub password: Option<String>,

    /// Deadline for opening a stream, in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl TunnelClientConfig {
    /// Pool configuration with `pool_size` applied
    pub fn effective_pool(&self) -> PoolConfig {
        let mut pool = self.pool.clone();
        if let Some(size) = self.pool_size {
            pool.size = size;
        }
        pool
    }

    /// Basic-auth credentials, if both parts are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// Dial timeout as a duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Whether this outbound spans several tunnel servers
    pub fn is_group(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// Every tunnel server of this outbound, `address` first
    pub fn all_addresses(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.address.as_str()).chain(self.addresses.iter().map(String::as_str))
    }

    /// Validate the tunnel client configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.tag.is_empty() {
            return Err("tunnel client tag must not be empty".to_string());
        }
        if self.tag == crate::router::DIRECT || self.tag == crate::router::REJECT {
            return Err(format!("tunnel client tag '{}' is reserved", self.tag));
        }
        for address in self.all_addresses() {
            Address::parse(address).map_err(|e| format!("tunnel client '{}': {}", self.tag, e))?;
        }
        if self.is_group() {
            self.health_check
                .validate()
                .map_err(|e| format!("tunnel client '{}': {}", self.tag, e))?;
        }
        validate_tls(self.transport, self.tls.as_ref())
            .map_err(|e| format!("tunnel client '{}': {}", self.tag, e))?;
        validate_credentials(&self.username, &self.password)?;
        self.effective_pool()
            .validate()
            .map_err(|e| format!("tunnel client '{}': {}", self.tag, e))
    }
}

/// Default health check target
fn default_check_url() -> String {
    "http://www.google.com/generate_204".to_string()
}

/// Default seconds between health checks
fn default_check_interval() -> u64 {
    30
}

/// Default deadline for one health check, in seconds
fn default_check_timeout() -> u64 {
    5
}

/// How a group measures its tunnel servers
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// Plain `http://` URL fetched through each server
    #[serde(default = "default_check_url")]
    pub url: String,

    /// Seconds between rounds
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,

    /// Deadline for one request, in seconds
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            url: default_check_url(),
            interval_secs: default_check_interval(),
            timeout_secs: default_check_timeout(),
        }
    }
}

impl HealthCheckConfig {
    /// Interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the check settings
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("http://") {
            return Err(format!("health check url must be http://: {}", self.url));
        }
        if self.interval_secs == 0 || self.timeout_secs == 0 {
            return Err("health check interval and timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Remote-side tunnel listener
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TunnelServerConfig {
    /// Listen address
    pub listen: String,

    /// Transport kind
    #[serde(default)]
    pub transport: TransportKind,

    /// TLS material, required for every transport except `tcp`
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// TCP socket options for accepted and outgoing connections
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Decoy `host:port` that receives anything failing the header check
    #[serde(default)]
    pub fallback: Option<String>,

    /// Required basic-auth user (HTTP/2 only)
    #[serde(default)]
    pub username: Option<String>,

    /// Required basic-auth password (HTTP/2 only)
    #[serde(default)]
    pub password: Option<String>,

    /// Deadline for reading the tunnel header, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Deadline for dialing the destination, in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// QUIC/HTTP/2 keep-alive interval, in seconds
    #[serde(default = "default_server_keepalive")]
    pub keepalive_interval: u64,
}

/// Default server keep-alive interval
fn default_server_keepalive() -> u64 {
    15
}

impl TunnelServerConfig {
    /// Create a minimal server configuration
    pub fn new(listen: impl Into<String>, transport: TransportKind) -> Self {
        TunnelServerConfig {
            listen: listen.into(),
            transport,
            tls: None,
            tcp: TcpConfig::default(),
            fallback: None,
            username: None,
            password: None,
            handshake_timeout_secs: default_handshake_timeout(),
            dial_timeout_secs: default_dial_timeout(),
            keepalive_interval: default_server_keepalive(),
        }
    }

    /// Basic-auth credentials, if both parts are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Dial timeout as a duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Validate the tunnel server configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.listen.is_empty() {
            return Err("tunnel server listen address must not be empty".to_string());
        }
        validate_tls(self.transport, self.tls.as_ref())
            .map_err(|e| format!("tunnel server {}: {}", self.listen, e))?;
        validate_credentials(&self.username, &self.password)?;
        if let Some(fallback) = &self.fallback {
            Address::parse(fallback).map_err(|e| format!("fallback {}: {}", fallback, e))?;
        }
        if self.handshake_timeout_secs == 0 {
            return Err("handshake_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn validate_tls(transport: TransportKind, tls: Option<&TlsConfig>) -> Result<(), String> {
    match (transport.requires_tls(), tls) {
        (true, None) => Err(format!("transport {} requires [tls]", transport)),
        (true, Some(tls)) => tls.validate(),
        (false, _) => Ok(()),
    }
}

fn validate_credentials(username: &Option<String>, password: &Option<String>) -> Result<(), String> {
    if username.is_some() != password.is_some() {
        return Err("username and password must be set together".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(transport: TransportKind) -> TunnelClientConfig {
        toml::from_str(&format!(
            r#"
tag = "proxy"
address = "203.0.113.7:9000"
transport = "{}"
"#,
            transport
        ))
        .unwrap()
    }

    fn tls() -> TlsConfig {
        TlsConfig {
            cert_file: Some("c.crt".into()),
            key_file: Some("c.key".into()),
            ca_file: Some("ca.crt".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_client_defaults() {
        let config = client(TransportKind::Tcp);
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.effective_pool().size, 2);
        assert!(config.credentials().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_pool_size_shorthand() {
        let mut config = client(TransportKind::Tcp);
        config.pool_size = Some(5);
        assert_eq!(config.effective_pool().size, 5);
    }

    #[test]
    fn test_client_requires_tls_material() {
        let mut config = client(TransportKind::Grpc);
        assert!(config.validate().unwrap_err().contains("requires [tls]"));
        config.tls = Some(tls());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_rejects_reserved_tag() {
        let mut config = client(TransportKind::Tcp);
        config.tag = "direct".into();
        assert!(config.validate().unwrap_err().contains("reserved"));
    }

    #[test]
    fn test_client_rejects_half_credentials() {
        let mut config = client(TransportKind::Http2);
        config.tls = Some(tls());
        config.username = Some("u".into());
        assert!(config.validate().is_err());
        config.password = Some("p".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.credentials(), Some(("u", "p")));
    }

    #[test]
    fn test_client_group() {
        let mut config: TunnelClientConfig = toml::from_str(
            r#"
tag = "proxy"
address = "203.0.113.7:9000"
addresses = ["203.0.113.8:9000", "[2001:db8::1]:9000"]

[health_check]
interval_secs = 60
"#,
        )
        .unwrap();
        assert!(config.is_group());
        assert_eq!(config.all_addresses().count(), 3);
        assert_eq!(config.health_check.interval(), Duration::from_secs(60));
        assert_eq!(config.health_check.timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());

        config.health_check.url = "https://example.com/".into();
        assert!(config.validate().unwrap_err().contains("http://"));
        config.health_check.url = default_check_url();
        config.addresses.push("no-port".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_validate() {
        let mut config = TunnelServerConfig::new("0.0.0.0:9000", TransportKind::Tcp);
        assert!(config.validate().is_ok());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));

        config.fallback = Some("not-an-address".into());
        assert!(config.validate().is_err());
        config.fallback = Some("127.0.0.1:8080".into());
        assert!(config.validate().is_ok());

        config.transport = TransportKind::Quic;
        assert!(config.validate().is_err());
    }
}
