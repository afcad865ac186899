//! RAII lease on a shared physical connection
//!
//! A [`Lease`] marks one logical stream as open on a physical connection.
//! Dropping it gives the stream slot back to the pool it came from.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Something that takes leases back
pub trait Release: Send + Sync {
    /// Called exactly once per lease, when it is dropped
    fn release(&self, id: u64);
}

/// Holds one stream's reference on connection `id`
pub struct Lease<T> {
    id: u64,
    conn: T,
    pool: Arc<dyn Release>,
}

impl<T> Lease<T> {
    /// Create a new lease
    pub fn new(id: u64, conn: T, pool: Arc<dyn Release>) -> Self {
        Lease { id, conn, pool }
    }

    /// Identifier of the leased connection inside its pool
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u64>>);

    impl Release for Recorder {
        fn release(&self, id: u64) {
            self.0.lock().unwrap().push(id);
        }
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let recorder = Arc::new(Recorder::default());
        let lease = Lease::new(7, "conn", recorder.clone());
        assert_eq!(*lease, "conn");
        assert_eq!(lease.id(), 7);
        assert!(recorder.0.lock().unwrap().is_empty());

        drop(lease);
        assert_eq!(*recorder.0.lock().unwrap(), vec![7]);
    }
}
