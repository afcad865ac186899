//! Tunnel header
//!
//! The first bytes of every logical stream: `[version][address]`, where
//! the address uses the layout from [`super::address`]. The remote side
//! treats anything that does not parse as foreign traffic.

use super::address::{Address, MAX_ENCODED_LEN};
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header version, kept for compatibility with older peers
pub const HEADER_VERSION: u8 = 0x00;

/// Largest possible encoded header
pub const MAX_HEADER_LEN: usize = 1 + MAX_ENCODED_LEN;

/// Destination announcement written once per logical stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHeader {
    /// Where the remote side should connect
    pub dst: Address,
}

impl TunnelHeader {
    /// Create a header for `dst`
    pub fn new(dst: Address) -> Self {
        TunnelHeader { dst }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(1 + self.dst.encoded_len());
        buf.put_u8(HEADER_VERSION);
        self.dst.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Write the header and flush, so it reaches the peer before any payload
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a header. Unknown versions are rejected as malformed.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let version = reader.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::MalformedAddress("truncated".into())
            } else {
                ProtocolError::Io(e)
            }
        })?;
        if version != HEADER_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let dst = Address::read_from(reader).await?;
        Ok(TunnelHeader { dst })
    }
}
