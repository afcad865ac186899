//! Destination address and its compact wire form
//!
//! Layout: `[atyp][addr][port: u16 BE]` where `addr` is 4 bytes for IPv4,
//! 16 bytes for IPv6 and a length-prefixed name for domains. The same
//! layout is used by SOCKS5 requests and the tunnel header.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;

/// Maximum domain name length
pub const MAX_DOMAIN_LEN: usize = 255;

/// Largest possible encoded address: type, length, name and port
pub const MAX_ENCODED_LEN: usize = 1 + 1 + MAX_DOMAIN_LEN + 2;

/// Kind of an [`Address`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// IPv4 address
    Ipv4,
    /// IPv6 address
    Ipv6,
    /// Domain name
    Domain,
}

/// Network destination: an IP socket address or a domain name with port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Build an address from a host and port. IP literals (with or
    /// without IPv6 brackets) become [`Address::Ip`].
    pub fn from_host_port(host: &str, port: u16) -> Result<Self, ProtocolError> {
        let trimmed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Address::Ip(SocketAddr::new(ip, port)));
        }
        if trimmed.is_empty() {
            return Err(ProtocolError::MalformedAddress("empty host".into()));
        }
        if trimmed.len() > MAX_DOMAIN_LEN {
            return Err(ProtocolError::DomainTooLong(trimmed.len()));
        }
        Ok(Address::Domain(trimmed.to_string(), port))
    }

    /// Parse a `host:port` string, e.g. `example.com:443` or `[::1]:80`
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::MalformedAddress(format!("missing port in {}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ProtocolError::MalformedAddress(format!("invalid port in {}", s)))?;
        if host.contains(':') && !host.starts_with('[') {
            return Err(ProtocolError::MalformedAddress(format!(
                "IPv6 host must be bracketed: {}",
                s
            )));
        }
        Self::from_host_port(host, port)
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part without port; IPv6 is not bracketed
    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// IP address, if this is not a domain
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(addr) => Some(addr.ip()),
            Address::Domain(..) => None,
        }
    }

    /// Kind of this address
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Ip(SocketAddr::V4(_)) => AddressKind::Ipv4,
            Address::Ip(SocketAddr::V6(_)) => AddressKind::Ipv6,
            Address::Domain(..) => AddressKind::Domain,
        }
    }

    /// Address type byte used on the wire
    pub fn atyp(&self) -> u8 {
        match self.kind() {
            AddressKind::Ipv4 => ATYP_IPV4,
            AddressKind::Ipv6 => ATYP_IPV6,
            AddressKind::Domain => ATYP_DOMAIN,
        }
    }

    /// Number of bytes [`Address::encode`] appends
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Address::Ip(SocketAddr::V4(_)) => 4,
            Address::Ip(SocketAddr::V6(_)) => 16,
            Address::Domain(domain, _) => 1 + domain.len(),
        } + 2
    }

    /// Append the wire form to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.reserve(self.encoded_len());
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                if domain.is_empty() {
                    return Err(ProtocolError::MalformedAddress("empty domain".into()));
                }
                if domain.len() > MAX_DOMAIN_LEN {
                    return Err(ProtocolError::DomainTooLong(domain.len()));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
        Ok(())
    }

    /// Wire form as a fresh buffer
    pub fn to_bytes(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode from the start of `buf`, returning the address and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let truncated = || ProtocolError::MalformedAddress("truncated".into());

        let atyp = *buf.first().ok_or_else(truncated)?;
        let (addr_len, host_start) = match atyp {
            ATYP_IPV4 => (4, 1),
            ATYP_IPV6 => (16, 1),
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(truncated)? as usize;
                if len == 0 {
                    return Err(ProtocolError::MalformedAddress("empty domain".into()));
                }
                (len, 2)
            }
            other => {
                return Err(ProtocolError::MalformedAddress(format!(
                    "unknown address type {:#04x}",
                    other
                )))
            }
        };

        let port_start = host_start + addr_len;
        let end = port_start + 2;
        if buf.len() < end {
            return Err(truncated());
        }
        let port = u16::from_be_bytes([buf[port_start], buf[port_start + 1]]);
        let addr = Self::from_raw(atyp, &buf[host_start..port_start], port)?;
        Ok((addr, end))
    }

    /// Read an address from `reader`
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let atyp = reader.read_u8().await.map_err(map_read_err)?;
        Self::read_with_type(atyp, reader).await
    }

    /// Read the rest of an address whose type byte was already consumed
    pub async fn read_with_type<R>(atyp: u8, reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut raw = [0u8; MAX_DOMAIN_LEN];
        let len = match atyp {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let len = reader.read_u8().await.map_err(map_read_err)? as usize;
                if len == 0 {
                    return Err(ProtocolError::MalformedAddress("empty domain".into()));
                }
                len
            }
            other => {
                return Err(ProtocolError::MalformedAddress(format!(
                    "unknown address type {:#04x}",
                    other
                )))
            }
        };
        reader
            .read_exact(&mut raw[..len])
            .await
            .map_err(map_read_err)?;
        let port = reader.read_u16().await.map_err(map_read_err)?;
        Self::from_raw(atyp, &raw[..len], port)
    }

    fn from_raw(atyp: u8, raw: &[u8], port: u16) -> Result<Self, ProtocolError> {
        match atyp {
            ATYP_IPV4 => {
                let octets: [u8; 4] = raw
                    .try_into()
                    .map_err(|_| ProtocolError::MalformedAddress("bad IPv4 length".into()))?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_IPV6 => {
                let octets: [u8; 16] = raw
                    .try_into()
                    .map_err(|_| ProtocolError::MalformedAddress("bad IPv6 length".into()))?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            _ => {
                let domain = std::str::from_utf8(raw)
                    .map_err(|_| ProtocolError::MalformedAddress("domain is not UTF-8".into()))?;
                Ok(Address::Domain(domain.to_string(), port))
            }
        }
    }

    /// Resolve to a socket address, performing DNS lookup for domains
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                }),
        }
    }
}

fn map_read_err(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::MalformedAddress("truncated".into())
    } else {
        ProtocolError::Io(err)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}
