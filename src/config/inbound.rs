//! Local proxy configuration
//!
//! Timeouts for the SOCKS5/HTTP inbound listeners and relay buffer sizing.

use crate::helper::{
    DEFAULT_BUFFER_SIZE, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_MAX_CACHED_BUFFERS,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default handshake timeout
fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

/// Default dial timeout
fn default_dial_timeout() -> u64 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

/// Inbound listener settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InboundConfig {
    /// Deadline for the whole SOCKS5/HTTP handshake, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Deadline for obtaining an outbound stream, in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for InboundConfig {
    fn default() -> Self {
        InboundConfig {
            handshake_timeout_secs: default_handshake_timeout(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl InboundConfig {
    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Dial timeout as a duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Default relay buffer size
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Default number of cached buffers
fn default_max_cached_buffers() -> usize {
    DEFAULT_MAX_CACHED_BUFFERS
}

/// Relay buffer pool settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RelayConfig {
    /// Size of every relay buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle buffers kept for reuse
    #[serde(default = "default_max_cached_buffers")]
    pub max_cached_buffers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            buffer_size: default_buffer_size(),
            max_cached_buffers: default_max_cached_buffers(),
        }
    }
}
