//! Error types for Tunnelrat
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for Tunnelrat operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection pool error
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Inbound or tunnel handshake failed
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Destination or tunnel remote could not be reached
    #[error("Dial {addr} failed: {reason}")]
    Dial {
        /// Address that was dialed
        addr: String,
        /// Why the dial failed
        reason: String,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection was routed to the reject outbound
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Errors raised while parsing handshake or tunnel header bytes
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Truncated input, unknown address type or empty domain
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    /// Domain names longer than 255 bytes cannot be encoded
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    /// Unsupported protocol version
    #[error("unsupported version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Unsupported SOCKS5 command
    #[error("unsupported cmd: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Unsupported SOCKS5 address type
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Invalid HTTP proxy request
    #[error("invalid http request: {0}")]
    InvalidHttp(String),

    /// IO error while reading or writing handshake bytes
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Connection pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been closed
    #[error("pool closed")]
    Closed,

    /// No ready physical connection right now; retry once
    #[error("dead connection: {0}")]
    Transient(String),

    /// Establishing a physical connection failed
    #[error("connect failed: {0}")]
    Connect(String),
}

impl PoolError {
    /// Whether the caller should retry the operation once
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::Transient(_))
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl From<&ProtocolError> for Socks5ReplyCode {
    /// Unsupported requests map to a generic failure so no internals leak
    fn from(_: &ProtocolError) -> Self {
        Socks5ReplyCode::GeneralFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks5_reply_code_to_u8() {
        assert_eq!(u8::from(Socks5ReplyCode::Succeeded), 0x00);
        assert_eq!(u8::from(Socks5ReplyCode::GeneralFailure), 0x01);
        assert_eq!(u8::from(Socks5ReplyCode::AddressTypeNotSupported), 0x08);
    }

    #[test]
    fn test_protocol_error_maps_to_general_failure() {
        let err = ProtocolError::UnsupportedCommand(0x03);
        assert_eq!(Socks5ReplyCode::from(&err), Socks5ReplyCode::GeneralFailure);

        let err = ProtocolError::UnsupportedAddressType(0x09);
        assert_eq!(Socks5ReplyCode::from(&err), Socks5ReplyCode::GeneralFailure);
    }

    #[test]
    fn test_tunnel_error_display() {
        let err = TunnelError::Config("missing listen address".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: missing listen address"
        );

        let err = TunnelError::Dial {
            addr: "example.com:443".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Dial example.com:443 failed: connection refused"
        );

        let err = TunnelError::Timeout("handshake".to_string());
        assert_eq!(err.to_string(), "Timeout: handshake");
    }

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(
            ProtocolError::MalformedAddress("truncated".into()).to_string(),
            "malformed address: truncated"
        );
        assert_eq!(
            ProtocolError::UnsupportedCommand(0x02).to_string(),
            "unsupported cmd: 0x02"
        );
        assert_eq!(
            ProtocolError::DomainTooLong(300).to_string(),
            "domain name too long: 300 bytes"
        );
    }

    #[test]
    fn test_error_from_conversions() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: TunnelError = io_err.into();
        assert!(matches!(err, TunnelError::Io(_)));

        let err: TunnelError = ProtocolError::UnsupportedVersion(4).into();
        assert!(matches!(err, TunnelError::Protocol(_)));

        let err: TunnelError = PoolError::Closed.into();
        assert_eq!(err.to_string(), "Pool error: pool closed");
    }

    #[test]
    fn test_pool_error_transient() {
        assert!(PoolError::Transient("slot 0".into()).is_transient());
        assert!(!PoolError::Closed.is_transient());
        assert!(!PoolError::Connect("refused".into()).is_transient());
    }
}
