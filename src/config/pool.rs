//! Connection pool configuration
//!
//! Defines how many physical connections a tunnel client keeps and how
//! they are re-established.

use crate::helper::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of physical connections per tunnel client
fn default_size() -> usize {
    2
}

/// Default idle timeout in seconds
fn default_idle_timeout() -> u64 {
    90
}

/// Default acquire timeout in milliseconds
fn default_acquire_timeout_ms() -> u64 {
    1000
}

/// Default connect timeout in seconds
fn default_connect_timeout() -> u64 {
    5
}

/// Default keep-alive ping interval in seconds
fn default_keepalive_interval() -> u64 {
    15
}

/// Default stream limit for one HTTP/2 client
fn default_max_streams_per_conn() -> usize {
    100
}

/// Connection pool configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PoolConfig {
    /// Number of physical connections (gRPC and QUIC)
    #[serde(default = "default_size")]
    pub size: usize,

    /// Idle HTTP/2 clients older than this are closed, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// How long `acquire` waits for a slot to come back, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Deadline for a single physical dial, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Keep-alive ping interval, in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Maximum concurrent streams on one HTTP/2 client
    #[serde(default = "default_max_streams_per_conn")]
    pub max_streams_per_conn: usize,

    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            size: default_size(),
            idle_timeout: default_idle_timeout(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            connect_timeout: default_connect_timeout(),
            keepalive_interval: default_keepalive_interval(),
            max_streams_per_conn: default_max_streams_per_conn(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Validate the pool configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err("pool size must be greater than 0".to_string());
        }
        if self.max_streams_per_conn == 0 {
            return Err("max_streams_per_conn must be greater than 0".to_string());
        }
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than 0".to_string());
        }
        if self.backoff.multiplier < 1.0 {
            return Err("backoff multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err("backoff jitter must be between 0 and 1".to_string());
        }
        Ok(())
    }

    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Acquire timeout as a duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Keep-alive interval as a duration
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }
}
