//! Helper utilities for Tunnelrat
//!
//! Shared defaults, the backoff policy used when physical connections
//! have to be re-established, and the task bookkeeping of the servers.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Relay buffer size, matching the maximum TLS record plaintext
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Maximum number of idle relay buffers kept around for reuse
pub const DEFAULT_MAX_CACHED_BUFFERS: usize = 1024;

/// Deadline for inbound handshakes and tunnel header reads
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Deadline for dialing a destination or opening a tunnel stream
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;

/// Exponential backoff parameters for physical reconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay after a failed dial, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Growth factor applied after every failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Randomization factor (0.2 means +/-20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Upper bound for a single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Default: 1s
fn default_base_delay_ms() -> u64 {
    1000
}

/// Default: 1.6
fn default_multiplier() -> f64 {
    1.6
}

/// Default: 0.2
fn default_jitter() -> f64 {
    0.2
}

/// Default: 20s
fn default_max_delay_ms() -> u64 {
    20_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffConfig {
    /// Build a backoff that never gives up; reconnect loops are bounded
    /// by pool shutdown instead.
    pub fn build(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.base_delay_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.jitter)
            .with_max_interval(Duration::from_millis(self.max_delay_ms))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Upper bound for any delay produced by [`BackoffConfig::build`]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Accept loop and connection handler bookkeeping for a server.
///
/// Hard close cancels every handler; graceful shutdown only stops the
/// accept loop and waits for handlers to finish on their own.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    accept: CancellationToken,
    handlers: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    /// Create a running lifecycle
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a connection handler; it is dropped on hard close
    pub fn spawn<F>(&self, handler: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.handlers.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = handler => {}
            }
        });
    }

    /// Resolves once the accept loop should stop
    pub async fn stopped(&self) {
        self.accept.cancelled().await
    }

    /// Whether the accept loop was told to stop
    pub fn is_stopped(&self) -> bool {
        self.accept.is_cancelled()
    }

    /// Token cancelled on hard close, for tasks that outlive one handler
    pub fn handler_token(&self) -> CancellationToken {
        self.handlers.clone()
    }

    /// Number of running handlers
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting and cancel every handler
    pub fn close(&self) {
        self.accept.cancel();
        self.handlers.cancel();
        self.tracker.close();
    }

    /// Stop accepting and wait for active handlers to drain
    pub async fn shutdown(&self) {
        self.accept.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Graceful shutdown bounded by `grace`; handlers still running after
    /// it are cancelled. Returns whether everything drained in time.
    pub async fn shutdown_timeout(&self, grace: Duration) -> bool {
        if tokio::time::timeout(grace, self.shutdown()).await.is_ok() {
            return true;
        }
        self.close();
        self.tracker.wait().await;
        false
    }
}
