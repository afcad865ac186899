//! Pool statistics
//!
//! Lock-free counters updated on the hot path and read as a snapshot.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for a connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Physical connections established
    pub total_created: AtomicUsize,
    /// Failed physical dial attempts
    pub total_failed: AtomicUsize,
    /// Connections found dead and replaced
    pub total_dead: AtomicUsize,
    /// Connections closed after idling
    pub total_expired: AtomicUsize,
    /// Successful acquisitions
    pub total_acquired: AtomicUsize,
    /// Acquisitions that ended in a transient error
    pub total_transient: AtomicUsize,
}

impl PoolStats {
    /// Create new pool stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a physical connection creation
    pub fn record_created(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed dial
    pub fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dead connection being dropped
    pub fn record_dead(&self) {
        self.total_dead.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idle connection expiration
    pub fn record_expired(&self) {
        self.total_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection handed to a caller
    pub fn record_acquired(&self) {
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition that found nothing ready
    pub fn record_transient(&self) {
        self.total_transient.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_dead: self.total_dead.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_transient: self.total_transient.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool statistics
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub total_created: usize,
    pub total_failed: usize,
    pub total_dead: usize,
    pub total_expired: usize,
    pub total_acquired: usize,
    pub total_transient: usize,
}
