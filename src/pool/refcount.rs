//! Reference-counted pool of HTTP/2 clients
//!
//! A client is busy while at least one stream is open on it and moves to
//! the idle list when the last stream ends. Idle clients past the idle
//! timeout are closed; a fresh idle client is reused before dialing.

use super::guard::{Lease, Release};
use super::stats::{PoolStats, PoolStatsSnapshot};
use super::{Connector, PhysicalConn};
use crate::config::PoolConfig;
use crate::error::PoolError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Busy<T> {
    conn: T,
    streams: usize,
}

struct Idle<T> {
    id: u64,
    conn: T,
    since: Instant,
}

struct Clients<T> {
    busy: HashMap<u64, Busy<T>>,
    /// Oldest first
    idle: Vec<Idle<T>>,
}

/// Pool that shares a physical client among many concurrent streams
pub struct RefCountPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    clients: Mutex<Clients<C::Conn>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    stats: PoolStats,
    this: Weak<RefCountPool<C>>,
}

impl<C: Connector> RefCountPool<C> {
    /// Create the pool and start its idle-eviction task
    pub fn new(connector: C, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new_cyclic(|this| RefCountPool {
            connector,
            config,
            clients: Mutex::new(Clients {
                busy: HashMap::new(),
                idle: Vec::new(),
            }),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            stats: PoolStats::new(),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&pool);
        let shutdown = pool.shutdown.clone();
        let interval = (pool.config.idle_timeout() / 2).max(std::time::Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match weak.upgrade() {
                    Some(pool) => pool.evict_idle(),
                    None => break,
                }
            }
        });

        pool
    }

    /// Lease a client with spare stream capacity, dialing one if needed
    pub async fn acquire(&self) -> Result<Lease<C::Conn>, PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }
        if let Some(lease) = self.try_reuse() {
            self.stats.record_acquired();
            return Ok(lease);
        }

        let conn = tokio::time::timeout(self.config.connect_timeout(), self.connector.connect())
            .await
            .map_err(|_| {
                self.stats.record_failed();
                PoolError::Connect(format!("timed out dialing {}", self.connector.remote()))
            })?
            .map_err(|e| {
                self.stats.record_failed();
                PoolError::Connect(format!("{:#}", e))
            })?;
        self.stats.record_created();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut clients = self.lock();
            if self.shutdown.is_cancelled() {
                conn.close();
                return Err(PoolError::Closed);
            }
            clients.busy.insert(
                id,
                Busy {
                    conn: conn.clone(),
                    streams: 1,
                },
            );
        }
        debug!("New HTTP/2 client {} to {}", id, self.connector.remote());
        self.stats.record_acquired();
        Ok(self.lease(id, conn))
    }

    fn try_reuse(&self) -> Option<Lease<C::Conn>> {
        let mut clients = self.lock();
        self.evict_locked(&mut clients);

        let max = self.config.max_streams_per_conn;
        let busy = clients
            .busy
            .iter_mut()
            .filter(|(_, b)| b.streams < max && b.conn.is_ready())
            .min_by_key(|(_, b)| b.streams);
        if let Some((id, busy)) = busy {
            busy.streams += 1;
            let (id, conn) = (*id, busy.conn.clone());
            return Some(self.lease(id, conn));
        }

        // Freshest idle client first
        while let Some(idle) = clients.idle.pop() {
            if !idle.conn.is_ready() {
                idle.conn.close();
                self.stats.record_dead();
                continue;
            }
            let conn = idle.conn.clone();
            clients.busy.insert(
                idle.id,
                Busy {
                    conn: idle.conn,
                    streams: 1,
                },
            );
            return Some(self.lease(idle.id, conn));
        }
        None
    }

    fn lease(&self, id: u64, conn: C::Conn) -> Lease<C::Conn> {
        let pool: Arc<dyn Release> = match self.this.upgrade() {
            Some(pool) => pool as Arc<dyn Release>,
            None => Arc::new(NoopRelease) as Arc<dyn Release>,
        };
        Lease::new(id, conn, pool)
    }

    /// Close idle clients older than the idle timeout or no longer usable
    pub fn evict_idle(&self) {
        let mut clients = self.lock();
        self.evict_locked(&mut clients);
    }

    fn evict_locked(&self, clients: &mut Clients<C::Conn>) {
        let idle_timeout = self.config.idle_timeout();
        let stats = &self.stats;
        clients.idle.retain(|idle| {
            let expired = idle.since.elapsed() >= idle_timeout;
            let dead = !idle.conn.is_ready();
            if expired || dead {
                idle.conn.close();
                if expired {
                    stats.record_expired();
                } else {
                    stats.record_dead();
                }
                debug!("Dropped idle HTTP/2 client {}", idle.id);
                false
            } else {
                true
            }
        });
        clients.busy.retain(|_, busy| busy.conn.is_ready());
    }

    /// Close every client; open streams fail on their next I/O
    pub fn close(&self) {
        self.shutdown.cancel();
        let mut clients = self.lock();
        for (_, busy) in clients.busy.drain() {
            busy.conn.close();
        }
        for idle in clients.idle.drain(..) {
            idle.conn.close();
        }
    }

    /// Number of (busy, idle) clients
    pub fn counts(&self) -> (usize, usize) {
        let clients = self.lock();
        (clients.busy.len(), clients.idle.len())
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, Clients<C::Conn>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Connector> Release for RefCountPool<C> {
    fn release(&self, id: u64) {
        let mut clients = self.lock();
        let done = match clients.busy.get_mut(&id) {
            Some(busy) => {
                busy.streams = busy.streams.saturating_sub(1);
                busy.streams == 0
            }
            None => false,
        };
        if !done {
            return;
        }
        if let Some(busy) = clients.busy.remove(&id) {
            if self.shutdown.is_cancelled() || !busy.conn.is_ready() {
                busy.conn.close();
                return;
            }
            clients.idle.push(Idle {
                id,
                conn: busy.conn,
                since: Instant::now(),
            });
        }
    }
}

struct NoopRelease;

impl Release for NoopRelease {
    fn release(&self, _id: u64) {}
}
