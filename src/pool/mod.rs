//! Physical connection pools
//!
//! Tunnel dialers multiplex many logical streams over a few long-lived
//! physical connections. Two pooling strategies are provided:
//!
//! - [`SlotPool`]: fixed number of slots picked round-robin, dead slots are
//!   recreated in the background (gRPC, QUIC)
//! - [`RefCountPool`]: clients shared while they have spare stream capacity,
//!   parked on an idle list once unused (HTTP/2 CONNECT)

mod guard;
mod refcount;
mod slots;
mod stats;

pub use guard::{Lease, Release};
pub use refcount::RefCountPool;
pub use slots::SlotPool;
pub use stats::{PoolStats, PoolStatsSnapshot};

use async_trait::async_trait;

/// Lifecycle of a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handshake still in progress
    Connecting,
    /// Usable for new streams
    Ready,
    /// Closed locally or by a graceful peer shutdown
    Shutdown,
    /// Failed; must be replaced
    Dead,
}

/// A physical connection that can carry many logical streams.
///
/// Clones share the same underlying connection.
pub trait PhysicalConn: Clone + Send + Sync + 'static {
    /// Current state
    fn state(&self) -> ConnState;

    /// Whether new streams can be opened
    fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    /// Close the connection; streams on it fail on their next I/O
    fn close(&self);
}

/// Factory for physical connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced
    type Conn: PhysicalConn;

    /// Dial and handshake a new physical connection
    async fn connect(&self) -> anyhow::Result<Self::Conn>;

    /// Remote address, for logging
    fn remote(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Fixed(ConnState);

    impl PhysicalConn for Fixed {
        fn state(&self) -> ConnState {
            self.0
        }

        fn close(&self) {}
    }

    #[test]
    fn test_only_ready_is_ready() {
        assert!(Fixed(ConnState::Ready).is_ready());
        assert!(!Fixed(ConnState::Connecting).is_ready());
        assert!(!Fixed(ConnState::Shutdown).is_ready());
        assert!(!Fixed(ConnState::Dead).is_ready());
    }
}
