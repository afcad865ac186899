//! Wire formats shared by the inbound handshakes and the tunnel
//!
//! - [`Address`]: compact destination encoding (type, address, port)
//! - [`TunnelHeader`]: version byte plus destination, first bytes of every
//!   logical stream
//! - credential digests for HTTP/2 basic auth

mod address;
mod digest;
mod header;

pub use address::{
    Address, AddressKind, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, MAX_DOMAIN_LEN, MAX_ENCODED_LEN,
};
pub use digest::{credential_digest, digest, Digest, DIGEST_LEN};
pub use header::{TunnelHeader, HEADER_VERSION, MAX_HEADER_LEN};
