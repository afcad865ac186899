//! Bidirectional relay
//!
//! Copies bytes between two duplex streams using buffers from a shared
//! [`BufferPool`]. The pool is created once at startup and handed to every
//! component that relays.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Pool of fixed-size byte buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

#[derive(Debug)]
struct BufferPoolInner {
    buffer_size: usize,
    max_cached: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    /// Create a pool handing out `buffer_size` byte buffers and keeping at
    /// most `max_cached` idle buffers
    pub fn new(buffer_size: usize, max_cached: usize) -> Self {
        BufferPool {
            inner: Arc::new(BufferPoolInner {
                buffer_size: buffer_size.max(1),
                max_cached,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Take a buffer; it goes back to the pool when dropped
    pub fn get(&self) -> PooledBuf {
        let buf = self
            .free()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Size of every buffer
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of idle buffers currently cached
    pub fn cached(&self) -> usize {
        self.free().len()
    }

    fn free(&self) -> MutexGuard<'_, Vec<Box<[u8]>>> {
        lock_free_list(&self.inner)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(
            crate::helper::DEFAULT_BUFFER_SIZE,
            crate::helper::DEFAULT_MAX_CACHED_BUFFERS,
        )
    }
}

fn lock_free_list(inner: &BufferPoolInner) -> MutexGuard<'_, Vec<Box<[u8]>>> {
    inner.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Buffer borrowed from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPoolInner>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = lock_free_list(&self.pool);
            if free.len() < self.pool.max_cached {
                free.push(buf);
            }
        }
    }
}

/// Whether `err` is the normal way a proxied session ends (peer closed or
/// reset) rather than a failure worth reporting
pub fn is_connection_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Relay bytes between `a` and `b` until either direction ends.
///
/// Returns on the first EOF or error. Both streams are dropped on return,
/// which unblocks and closes the other direction.
pub async fn relay<A, B>(a: A, b: B, pool: &BufferPool) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = copy_with_pool(&mut a_read, &mut b_write, pool);
    let b_to_a = copy_with_pool(&mut b_read, &mut a_write, pool);

    tokio::select! {
        result = a_to_b => {
            if let Ok(bytes) = result {
                debug!("A->B finished: {} bytes", bytes);
            }
            result.map(|_| ())
        }
        result = b_to_a => {
            if let Ok(bytes) = result {
                debug!("B->A finished: {} bytes", bytes);
            }
            result.map(|_| ())
        }
    }
}

async fn copy_with_pool<R, W>(reader: &mut R, writer: &mut W, pool: &BufferPool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // Propagate the half-close; the peer may already be gone
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[test]
    fn test_buffer_pool_reuses_buffers() {
        let pool = BufferPool::new(1024, 4);
        assert_eq!(pool.cached(), 0);
        {
            let buf = pool.get();
            assert_eq!(buf.len(), 1024);
        }
        assert_eq!(pool.cached(), 1);
        let _a = pool.get();
        assert_eq!(pool.cached(), 0);
    }

    #[test]
    fn test_buffer_pool_caps_cache() {
        let pool = BufferPool::new(16, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.cached(), 2);
    }

    #[test]
    fn test_default_pool_uses_tls_record_size() {
        assert_eq!(BufferPool::default().buffer_size(), 16 * 1024);
    }

    #[test]
    fn test_is_connection_closed() {
        assert!(is_connection_closed(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(is_connection_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_connection_closed(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_connection_closed(&io::Error::new(
            io::ErrorKind::Other,
            "boom"
        )));
    }

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let pool = BufferPool::new(8, 4);
        let (mut client, relay_a) = duplex(64);
        let (relay_b, mut server) = duplex(64);

        let handle = tokio::spawn(async move { relay(relay_a, relay_b, &pool).await });

        client.write_all(b"hello through a small buffer").await.unwrap();
        let mut got = [0u8; 28];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello through a small buffer");

        server.write_all(b"pong").await.unwrap();
        let mut got = [0u8; 4];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_returns_when_either_side_closes() {
        let pool = BufferPool::default();
        let (client, relay_a) = duplex(64);
        let (relay_b, mut server) = duplex(64);

        let handle = tokio::spawn(async move { relay(relay_a, relay_b, &pool).await });
        drop(client);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay did not return")
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_relay_returns_when_far_side_closes() {
        let pool = BufferPool::default();
        let (mut client, relay_a) = duplex(64);
        let (relay_b, server) = duplex(64);

        let handle = tokio::spawn(async move { relay(relay_a, relay_b, &pool).await });
        drop(server);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay did not return")
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
