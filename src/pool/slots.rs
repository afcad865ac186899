//! Fixed-size round-robin pool of physical connections
//!
//! Used by the gRPC and QUIC dialers. A slot whose connection is not ready
//! is recreated in the background; the caller that noticed falls back to
//! another ready slot or waits briefly for the replacement.

use super::stats::{PoolStats, PoolStatsSnapshot};
use super::{Connector, PhysicalConn};
use crate::config::PoolConfig;
use crate::error::PoolError;
use backoff::backoff::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Slot<T> {
    conn: Option<T>,
    reconnecting: bool,
}

impl<T: PhysicalConn> Slot<T> {
    fn ready(&self) -> Option<T> {
        self.conn.as_ref().filter(|c| c.is_ready()).cloned()
    }
}

/// Round-robin pool with lazy background reconnects
pub struct SlotPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    slots: Mutex<Vec<Slot<C::Conn>>>,
    /// Rotation index; only ever incremented
    next: AtomicUsize,
    /// Bumped every time a slot receives a fresh connection
    replaced: watch::Sender<u64>,
    shutdown: CancellationToken,
    stats: PoolStats,
}

impl<C: Connector> SlotPool<C> {
    /// Create a pool with `config.size` empty slots. Nothing is dialed
    /// until [`SlotPool::warm_up`] or the first [`SlotPool::acquire`].
    pub fn new(connector: C, config: PoolConfig) -> Arc<Self> {
        let size = config.size.max(1);
        let slots = (0..size)
            .map(|_| Slot {
                conn: None,
                reconnecting: false,
            })
            .collect();
        let (replaced, _) = watch::channel(0);

        Arc::new(SlotPool {
            connector,
            config,
            slots: Mutex::new(slots),
            next: AtomicUsize::new(0),
            replaced,
            shutdown: CancellationToken::new(),
            stats: PoolStats::new(),
        })
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.config.size.max(1)
    }

    /// Start dialing every empty slot in the background
    pub async fn warm_up(self: &Arc<Self>) {
        info!(
            "Warming up {} connections to {}",
            self.size(),
            self.connector.remote()
        );
        let mut slots = self.slots.lock().await;
        for index in 0..slots.len() {
            if slots[index].ready().is_none() {
                self.schedule_reconnect(&mut slots, index);
            }
        }
    }

    /// Pick the next connection in rotation.
    ///
    /// Returns [`PoolError::Transient`] if no slot became ready within the
    /// acquire timeout; callers retry such an error once.
    pub async fn acquire(self: &Arc<Self>) -> Result<C::Conn, PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }

        // Subscribe before inspecting slots so no replacement is missed
        let mut replaced = self.replaced.subscribe();
        let size = self.size();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % size;

        {
            let mut slots = self.slots.lock().await;
            if let Some(conn) = slots[index].ready() {
                self.stats.record_acquired();
                return Ok(conn);
            }

            self.schedule_reconnect(&mut slots, index);

            let fallback = (1..size)
                .map(|offset| (index + offset) % size)
                .find_map(|other| slots[other].ready());
            if let Some(conn) = fallback {
                debug!("Slot {} not ready, using another slot", index);
                self.stats.record_acquired();
                return Ok(conn);
            }
        }

        let wait = async {
            loop {
                if replaced.changed().await.is_err() {
                    return Err(PoolError::Closed);
                }
                let slots = self.slots.lock().await;
                if let Some(conn) = slots.iter().find_map(Slot::ready) {
                    return Ok(conn);
                }
            }
        };

        let result = tokio::select! {
            result = wait => result,
            _ = self.shutdown.cancelled() => Err(PoolError::Closed),
            _ = tokio::time::sleep(self.config.acquire_timeout()) => {
                Err(PoolError::Transient(format!(
                    "no ready connection to {}",
                    self.connector.remote()
                )))
            }
        };
        match &result {
            Ok(_) => self.stats.record_acquired(),
            Err(PoolError::Transient(_)) => self.stats.record_transient(),
            Err(_) => {}
        }
        result
    }

    /// Close every pooled connection and stop reconnecting. Streams still
    /// open on those connections fail on their next I/O.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            if let Some(conn) = slot.conn.take() {
                conn.close();
            }
        }
        debug!("Pool to {} closed", self.connector.remote());
    }

    /// Whether [`SlotPool::close`] was called
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    fn schedule_reconnect(self: &Arc<Self>, slots: &mut [Slot<C::Conn>], index: usize) {
        let slot = &mut slots[index];
        if slot.reconnecting || self.shutdown.is_cancelled() {
            return;
        }
        if let Some(old) = slot.conn.take() {
            debug!("Slot {} to {} is dead", index, self.connector.remote());
            old.close();
            self.stats.record_dead();
        }
        slot.reconnecting = true;

        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.reconnect(index).await });
    }

    async fn reconnect(self: Arc<Self>, index: usize) {
        let mut backoff = self.config.backoff.build();
        let connect_timeout = self.config.connect_timeout();

        loop {
            let attempt = tokio::time::timeout(connect_timeout, self.connector.connect());
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = attempt => result,
            };

            match result {
                Ok(Ok(conn)) => {
                    let mut slots = self.slots.lock().await;
                    let slot = &mut slots[index];
                    slot.reconnecting = false;
                    if self.shutdown.is_cancelled() {
                        conn.close();
                        return;
                    }
                    if let Some(old) = slot.conn.replace(conn) {
                        old.close();
                    }
                    drop(slots);

                    self.stats.record_created();
                    self.replaced.send_modify(|generation| *generation = generation.wrapping_add(1));
                    debug!("Slot {} connected to {}", index, self.connector.remote());
                    return;
                }
                Ok(Err(e)) => {
                    self.stats.record_failed();
                    warn!(
                        "Failed to connect slot {} to {}: {:#}",
                        index,
                        self.connector.remote(),
                        e
                    );
                }
                Err(_) => {
                    self.stats.record_failed();
                    warn!(
                        "Timed out connecting slot {} to {}",
                        index,
                        self.connector.remote()
                    );
                }
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.config.backoff.max_delay());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.slots.lock().await[index].reconnecting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnState;
    use crate::helper::BackoffConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Clone, Debug)]
    struct MockConn {
        id: usize,
        alive: Arc<AtomicBool>,
    }

    impl PhysicalConn for MockConn {
        fn state(&self) -> ConnState {
            if self.alive.load(Ordering::SeqCst) {
                ConnState::Ready
            } else {
                ConnState::Dead
            }
        }

        fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        dials: Arc<AtomicUsize>,
        /// Number of initial dials that fail
        failures: Arc<AtomicUsize>,
        conns: Arc<std::sync::Mutex<Vec<MockConn>>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Conn = MockConn;

        async fn connect(&self) -> anyhow::Result<MockConn> {
            let id = self.dials.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("connection refused");
            }
            let conn = MockConn {
                id,
                alive: Arc::new(AtomicBool::new(true)),
            };
            self.conns.lock().unwrap().push(conn.clone());
            Ok(conn)
        }

        fn remote(&self) -> String {
            "mock:1".to_string()
        }
    }

    fn test_config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            backoff: BackoffConfig {
                base_delay_ms: 10,
                multiplier: 1.5,
                jitter: 0.0,
                max_delay_ms: 50,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_dials_lazily() {
        let connector = MockConnector::default();
        let pool = SlotPool::new(connector.clone(), test_config(2));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_ready());
        assert!(connector.dials.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_round_robin_after_warm_up() {
        let connector = MockConnector::default();
        let pool = SlotPool::new(connector.clone(), test_config(2));
        pool.warm_up().await;

        // Wait for both slots to be filled
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.stats().total_created < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_recreates_dead_slots() {
        let connector = MockConnector::default();
        let pool = SlotPool::new(connector.clone(), test_config(2));
        pool.warm_up().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.stats().total_created < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Force both physical connections into the dead state
        for conn in connector.conns.lock().unwrap().iter() {
            conn.close();
        }

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_ready());
        assert!(conn.id >= 2);
        assert!(pool.stats().total_dead >= 1);
    }

    #[tokio::test]
    async fn test_reconnect_backs_off_until_success() {
        let connector = MockConnector::default();
        connector.failures.store(3, Ordering::SeqCst);
        let pool = SlotPool::new(connector.clone(), test_config(1));

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_ready());
        assert_eq!(connector.dials.load(Ordering::SeqCst), 4);
        assert_eq!(pool.stats().total_failed, 3);
    }

    #[tokio::test]
    async fn test_transient_error_when_nothing_comes_back() {
        let connector = MockConnector::default();
        connector.failures.store(usize::MAX, Ordering::SeqCst);
        let mut config = test_config(1);
        config.acquire_timeout_ms = 50;
        let pool = SlotPool::new(connector, config);

        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(pool.stats().total_transient, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_closes_connections() {
        let connector = MockConnector::default();
        let pool = SlotPool::new(connector.clone(), test_config(1));
        let conn = pool.acquire().await.unwrap();

        pool.close().await;
        assert!(!conn.is_ready());
        assert!(pool.is_closed());
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
    }
}
