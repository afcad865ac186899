//! Outbound spanning several tunnel servers
//!
//! Every member is measured by fetching a small HTTP resource through it.
//! Streams go to the member with the lowest round-trip time; the
//! measurement repeats on a fixed interval and whenever no member is
//! usable at dial time.

use super::{BoxStream, StreamDialer};
use crate::config::HealthCheckConfig;
use crate::error::TunnelError;
use crate::protocol::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NONE: usize = usize::MAX;

/// Largest response head accepted from the check target
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// One tunnel server of a group
pub struct GroupMember {
    /// Server address, for logging
    pub address: String,
    /// Dialer bound to that server
    pub dialer: Arc<dyn StreamDialer>,
}

/// Request sent through each member and how long it may take
#[derive(Debug, Clone)]
pub struct HealthCheck {
    target: Address,
    request: Arc<[u8]>,
    timeout: Duration,
    interval: Duration,
}

impl HealthCheck {
    /// Build the check from configuration
    pub fn from_config(config: &HealthCheckConfig) -> Result<Self> {
        Self::new(&config.url, config.timeout(), config.interval())
    }

    /// GET `url` through each member within `timeout`, every `interval`
    pub fn new(url: &str, timeout: Duration, interval: Duration) -> Result<Self> {
        let uri: http::Uri = url
            .parse()
            .with_context(|| format!("Invalid health check url: {}", url))?;
        if uri.scheme_str() != Some("http") {
            anyhow::bail!("Health check url must use http: {}", url);
        }
        let host = uri
            .host()
            .with_context(|| format!("Health check url has no host: {}", url))?;
        let target = Address::from_host_port(host, uri.port_u16().unwrap_or(80))?;
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let authority = uri.authority().map(|a| a.as_str()).unwrap_or(host);
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: tunnelrat/{}\r\nConnection: close\r\n\r\n",
            path,
            authority,
            crate::VERSION
        );

        Ok(HealthCheck {
            target,
            request: request.into_bytes().into(),
            timeout,
            interval,
        })
    }

    /// Time one request/response exchange through `dialer`
    async fn round_trip(&self, dialer: &dyn StreamDialer) -> Result<Duration, TunnelError> {
        let start = Instant::now();
        let exchange = async {
            let mut stream = dialer.dial(&self.target).await?;
            stream.write_all(&self.request).await?;
            stream.flush().await?;
            read_response_head(&mut stream).await
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TunnelError::Timeout(format!("health check to {}", self.target)))??;
        Ok(start.elapsed())
    }
}

/// Read until a complete HTTP response head has arrived
async fn read_response_head(stream: &mut BoxStream) -> Result<u16, TunnelError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::Transport(
                "connection closed before response".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => return Ok(response.code.unwrap_or_default()),
            Ok(httparse::Status::Partial) if buf.len() < MAX_RESPONSE_HEAD => {}
            Ok(httparse::Status::Partial) => {
                return Err(TunnelError::Transport("response head too large".into()))
            }
            Err(e) => return Err(TunnelError::Transport(format!("bad response: {}", e))),
        }
    }
}

/// [`StreamDialer`] that routes through the fastest healthy member
pub struct DialerGroup {
    tag: String,
    members: Vec<GroupMember>,
    check: HealthCheck,
    active: AtomicUsize,
    picking: Mutex<()>,
    checking: AtomicBool,
    cancel: CancellationToken,
    this: Weak<DialerGroup>,
}

impl DialerGroup {
    /// Create a group. Nothing is measured until the first dial.
    pub fn new(tag: impl Into<String>, members: Vec<GroupMember>, check: HealthCheck) -> Arc<Self> {
        Arc::new_cyclic(|this| DialerGroup {
            tag: tag.into(),
            members,
            check,
            active: AtomicUsize::new(NONE),
            picking: Mutex::new(()),
            checking: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            this: this.clone(),
        })
    }

    /// Index of the member currently in use
    pub fn active(&self) -> Option<usize> {
        match self.active.load(Ordering::Acquire) {
            NONE => None,
            index => Some(index),
        }
    }

    /// Address of the member currently in use
    pub fn active_address(&self) -> Option<&str> {
        self.active().map(|i| self.members[i].address.as_str())
    }

    /// Measure every member and switch to the fastest healthy one
    pub async fn pick(&self) -> Option<usize> {
        let _picking = self.picking.lock().await;
        self.measure().await
    }

    async fn measure(&self) -> Option<usize> {
        let mut rounds = JoinSet::new();
        for (index, member) in self.members.iter().enumerate() {
            let dialer = member.dialer.clone();
            let check = self.check.clone();
            rounds.spawn(async move { (index, check.round_trip(dialer.as_ref()).await) });
        }

        let mut best: Option<(usize, Duration)> = None;
        while let Some(joined) = rounds.join_next().await {
            let Ok((index, result)) = joined else {
                continue;
            };
            match result {
                Ok(rtt) => {
                    debug!("{} via {}: {:?}", self.tag, self.members[index].address, rtt);
                    if best.map_or(true, |(_, fastest)| rtt < fastest) {
                        best = Some((index, rtt));
                    }
                }
                Err(e) => debug!("{} via {} unhealthy: {}", self.tag, self.members[index].address, e),
            }
        }

        let picked = best.map(|(index, _)| index);
        let previous = self.active.swap(picked.unwrap_or(NONE), Ordering::AcqRel);
        match best {
            Some((index, rtt)) if previous != index => {
                info!("{} now using {} ({:?})", self.tag, self.members[index].address, rtt)
            }
            None if previous != NONE => warn!("{}: no healthy tunnel server", self.tag),
            _ => {}
        }
        picked
    }

    /// Start the periodic measurement once; it stops on close or when the
    /// group is dropped
    fn start_checks(&self) {
        if self.checking.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.this.clone();
        let cancel = self.cancel.clone();
        let interval = self.check.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(group) = this.upgrade() else {
                    break;
                };
                group.pick().await;
            }
        });
    }

    async fn current(&self) -> Result<usize, TunnelError> {
        if let Some(index) = self.active() {
            return Ok(index);
        }
        let _picking = self.picking.lock().await;
        // Someone else may have picked while we waited
        if let Some(index) = self.active() {
            return Ok(index);
        }
        self.measure().await.ok_or_else(|| TunnelError::Dial {
            addr: self.tag.clone(),
            reason: "no healthy tunnel server".into(),
        })
    }
}

#[async_trait]
impl StreamDialer for DialerGroup {
    async fn dial(&self, dst: &Address) -> Result<BoxStream, TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Dial {
                addr: self.tag.clone(),
                reason: "outbound closed".into(),
            });
        }
        self.start_checks();
        let index = self.current().await?;
        self.members[index].dialer.dial(dst).await
    }

    async fn close(&self) {
        self.cancel.cancel();
        for member in &self.members {
            member.dialer.close().await;
        }
    }
}

impl Drop for DialerGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
