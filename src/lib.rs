//! # Tunnelrat - Local Proxy with a Disguised Tunnel
//!
//! Tunnelrat accepts SOCKS5 and HTTP proxy connections locally, decides per
//! destination whether to connect directly, refuse, or go through a tunnel,
//! and carries tunnelled sessions to a remote endpoint over one of several
//! transports.
//!
//! ## Features
//!
//! - **Inbound**: SOCKS5 (no auth, CONNECT) and HTTP proxy (CONNECT and plain forwarding)
//! - **Routing**: first-match rules on domain suffix, keyword, exact domain and IP CIDR
//! - **Transports**: raw TCP, TLS, gRPC over HTTP/2, HTTP/2 CONNECT and QUIC
//! - **Pooling**: warm multiplexed connections with per-connection stream caps
//! - **Fallback**: streams that fail the tunnel header check are handed to a decoy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tunnelrat::config::load_config;
//! use tunnelrat::relay::BufferPool;
//! use tunnelrat::tunnel::TunnelServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let buffers = BufferPool::new(config.relay.buffer_size, config.relay.max_cached_buffers);
//!     let server = TunnelServer::bind(&config.tunnel_servers[0], buffers).await?;
//!     server.serve().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! App -> Inbound (SOCKS5/HTTP) -> Router -> Dialer -> Tunnel -> TunnelServer -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod helper;
pub mod inbound;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod tls;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{ProtocolError, TunnelError};
pub use inbound::{InboundKind, InboundServer};
pub use protocol::{Address, TunnelHeader};
pub use router::Router;
pub use transport::{create_dialer, StreamDialer};
pub use tunnel::TunnelServer;

/// Version of the Tunnelrat library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
